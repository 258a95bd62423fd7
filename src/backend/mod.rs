//! Chain access behind one trait, with an Electrum indexer and a legacy node behind it.

pub mod electrum;
pub mod node;

use crate::config::{BackendConfig, BackendMode};
use crate::error::Result;
use crate::keys;
use async_trait::async_trait;
use bitcoin::{Amount, ScriptBuf};
use std::sync::Arc;

pub use electrum::ElectrumBackend;
pub use node::NodeBackend;

/// An address together with its output script, so each backend can key it its own way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchAddress {
    pub address: String,
    pub script_pubkey: ScriptBuf,
}

impl WatchAddress {
    pub fn new(address: impl Into<String>, script_pubkey: ScriptBuf) -> Self {
        Self { address: address.into(), script_pubkey }
    }

    pub fn scripthash(&self) -> String {
        keys::scripthash(&self.script_pubkey)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub amount: Amount,
    /// Block height; zero or below means unconfirmed.
    pub height: i64,
}

impl Utxo {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: String,
    pub height: i64,
    /// Seconds since the epoch, when the backend reports one.
    pub timestamp: Option<u64>,
}

/// How far back a history query reaches. Only the legacy node honours it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    Full,
    RecentHours(u64),
}

impl HistoryWindow {
    /// Entry count requested from `listtransactions` for this window.
    pub fn entry_count(&self) -> usize {
        match self {
            HistoryWindow::Full => 1000,
            HistoryWindow::RecentHours(h) => {
                let hours = if *h == 0 { 24 } else { *h as usize };
                100.max(hours * 24)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Indexer,
    Legacy,
}

#[async_trait]
pub trait ChainBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// All unspent outputs, confirmed or not.
    async fn list_unspent(&self, addr: &WatchAddress) -> Result<Vec<Utxo>>;

    async fn list_confirmed_unspent(&self, addr: &WatchAddress) -> Result<Vec<Utxo>> {
        let all = self.list_unspent(addr).await?;
        Ok(all.into_iter().filter(Utxo::is_confirmed).collect())
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>>;

    /// Submit a serialized transaction; returns the txid reported by the backend.
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String>;

    async fn get_history(&self, addr: &WatchAddress, window: HistoryWindow) -> Result<Vec<HistoryEntry>>;

    /// Current chain tip height.
    async fn subscribe_tip(&self) -> Result<u64>;

    /// Opaque activity hash for the address, if the backend has one.
    async fn address_status(&self, _addr: &WatchAddress) -> Result<Option<String>> {
        Ok(None)
    }

    /// Register interest in an address. A no-op unless the backend needs it.
    async fn watch_address(&self, _addr: &WatchAddress) -> Result<()> {
        Ok(())
    }
}

/// Build the backend selected in config. The variant is fixed for the session.
pub fn connect(cfg: &BackendConfig) -> Result<Arc<dyn ChainBackend>> {
    match cfg.mode {
        BackendMode::Electrum => {
            tracing::info!("🔌 Using Electrum indexer at {}:{} (tls: {})", cfg.host, cfg.port, cfg.tls);
            Ok(Arc::new(ElectrumBackend::new(cfg.clone())?))
        }
        BackendMode::Node => {
            tracing::info!("🔌 Using legacy node RPC at {}:{}", cfg.host, cfg.port);
            Ok(Arc::new(NodeBackend::new(cfg.clone())?))
        }
    }
}
