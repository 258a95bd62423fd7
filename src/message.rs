use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Bucket for inbound messages whose sender key could not be recovered.
pub const ANONYMOUS_CONTACT: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageStatus {
    Sending = 0,
    BroadcastUnconfirmed = 1,
    Confirmed = 2,
}

impl MessageStatus {
    pub fn from_confirmations(confirmations: u64) -> Self {
        if confirmations > 0 {
            MessageStatus::Confirmed
        } else {
            MessageStatus::BroadcastUnconfirmed
        }
    }

    /// Status for a transaction observed at `height` with the chain tip at `tip`.
    pub fn at_height(height: i64, tip: u64) -> Self {
        Self::from_confirmations(confirmations(height, tip))
    }
}

pub fn confirmations(height: i64, tip: u64) -> u64 {
    if height > 0 {
        (tip as i64 - height + 1).max(0) as u64
    } else {
        0
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Sending => write!(f, "sending"),
            MessageStatus::BroadcastUnconfirmed => write!(f, "unconfirmed"),
            MessageStatus::Confirmed => write!(f, "confirmed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Outgoing {
        #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
        amount: Option<Amount>,
        #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
        fee: Option<Amount>,
        #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
        total_spent: Option<Amount>,
    },
    Incoming {
        #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
        amount: Option<Amount>,
    },
}

/// One chat line. `id` is the carrying transaction's txid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    pub status: MessageStatus,
    pub text: String,
    pub kind: MessageKind,
}

impl Message {
    pub fn is_outgoing(&self) -> bool {
        matches!(self.kind, MessageKind::Outgoing { .. })
    }

    pub fn amount(&self) -> Option<Amount> {
        match &self.kind {
            MessageKind::Outgoing { amount, .. } | MessageKind::Incoming { amount } => *amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Counterparty public key, hex.
    pub id: String,
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub unread: u32,
}

impl Contact {
    /// `...` followed by the last four characters of the key.
    pub fn default_name(id: &str) -> String {
        let tail = if id.len() > 4 { &id[id.len() - 4..] } else { id };
        format!("...{tail}")
    }
}

/// Emitted whenever a message is appended or its status changes.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub contact_id: String,
    pub message: Message,
    pub is_status_update: bool,
    pub is_inbound: bool,
}

/// Where a transaction sits in the scanner's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxLifecycle {
    Unseen,
    Seen,
    SelfSent,
    ReceivedKnown,
    ReceivedUnknownSender,
    Ignored,
    PendingContactResolution,
    Processed,
}

/// A self-sent transaction whose recipient is not yet a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    pub recipient_address: String,
    pub payload: String,
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub amount: Option<Amount>,
    pub timestamp: u64,
    pub height: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    pub processed: BTreeSet<String>,
    /// Last address-status hash reported by the indexer.
    pub cursor: Option<String>,
    pub pending: BTreeMap<String, PendingSend>,
}

impl ScanState {
    pub fn reset(&mut self) {
        self.processed.clear();
        self.pending.clear();
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
