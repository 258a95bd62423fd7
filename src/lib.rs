// Library interface for chainchat
// The CLI binaries and the integration tests use the messaging engine through this crate.

pub mod backend;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fees;
pub mod keys;
pub mod message;
pub mod metrics;
pub mod scanner;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod wallet;

pub use backend::{BackendKind, ChainBackend, HistoryEntry, HistoryWindow, Utxo, WatchAddress};
pub use error::{ChatError, Result, ServiceState};
pub use keys::{ChainParams, KeyPair};
pub use message::{ChatEvent, Contact, Message, MessageKind, MessageStatus, TxLifecycle};
pub use scanner::{Balance, ChainScanner, Classification, ScanReport};
pub use storage::{ChatStore, KvStore, MemoryStore, Store};
pub use wallet::Wallet;
