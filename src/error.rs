use bitcoin::Amount;
use thiserror::Error;

/// Lifecycle of the wallet service object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Loading,
    Ready,
    Failed(String),
}

/// Errors surfaced by the messaging engine.
///
/// Only user-initiated operations (open, send, rescan, contact edits) return
/// these to the caller. Background ticks log and drop them.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid WIF key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Error object returned by the server, message kept verbatim.
    #[error("{0}")]
    Rpc(String),

    #[error(
        "Insufficient funds: need at least {:.8} (available {:.8}); fee rate {fee_rate} sat/vB ({:.8} for ~{vbytes} vbytes)",
        .required.to_btc(), .available.to_btc(), .fee.to_btc()
    )]
    InsufficientFunds {
        required: Amount,
        available: Amount,
        fee: Amount,
        fee_rate: u64,
        vbytes: u64,
    },

    #[error("Signing error: {0}")]
    Signing(String),

    /// Broadcast rejection, message kept verbatim from the backend.
    #[error("{0}")]
    Broadcast(String),

    #[error("Could not derive shared secret")]
    KeyAgreement,

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Wallet not ready (state: {0:?})")]
    NotReady(ServiceState),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to decode {0}")]
    Decode(String),
}

impl ChatError {
    /// True for failures of the transport rather than of the request.
    pub fn is_connection(&self) -> bool {
        matches!(self, ChatError::Connection(_))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Decode(format!("backend response: {e}"))
    }
}

impl From<bincode::Error> for ChatError {
    fn from(e: bincode::Error) -> Self {
        ChatError::Storage(format!("serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
