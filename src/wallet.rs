//! The wallet session: key, backend, scanner and background sync in one service object.

use crate::backend::{self, BackendKind, ChainBackend};
use crate::config::{Config, WalletSettings};
use crate::crypto::{self, KdfParams};
use crate::error::{ChatError, Result, ServiceState};
use crate::keys::{self, ChainParams, KeyPair};
use crate::scanner::ChainScanner;
use crate::storage::{self, ChatStore, KvStore};
use crate::sync::{self, BalanceCallback, SyncState};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

pub struct Wallet {
    config: Config,
    chain: ChainParams,
    kv: Arc<dyn KvStore>,
    state: ServiceState,
    scanner: Option<Arc<ChainScanner>>,
    sync_state: Arc<Mutex<SyncState>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    sync_task: Option<JoinHandle<()>>,
}

impl Wallet {
    pub fn new(config: Config, kv: Arc<dyn KvStore>) -> Self {
        let chain = ChainParams::parse(&config.chain.network);
        Self {
            config,
            chain,
            kv,
            state: ServiceState::Uninitialized,
            scanner: None,
            sync_state: Arc::new(Mutex::new(SyncState::default())),
            shutdown_tx: None,
            sync_task: None,
        }
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn chain(&self) -> &ChainParams {
        &self.chain
    }

    /// Stored settings, else the config file's `[wallet]` section.
    pub fn settings(&self) -> WalletSettings {
        storage::load_global_settings(self.kv.as_ref())
            .ok()
            .flatten()
            .unwrap_or_else(|| self.config.wallet.clone())
            .normalized()
    }

    /// The active session, or `NotReady` with the current state.
    pub fn scanner(&self) -> Result<Arc<ChainScanner>> {
        match (&self.state, &self.scanner) {
            (ServiceState::Ready, Some(s)) => Ok(s.clone()),
            _ => Err(ChatError::NotReady(self.state.clone())),
        }
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Import a WIF and connect to the configured backend.
    pub async fn open(&mut self, settings: WalletSettings, secret: &str) -> Result<Arc<ChainScanner>> {
        self.state = ServiceState::Loading;
        let keys = match keys::import(secret, &self.chain) {
            Ok(k) => k,
            Err(e) => {
                self.state = ServiceState::Failed(e.to_string());
                return Err(e);
            }
        };
        let backend = match backend::connect(&self.config.backend) {
            Ok(b) => b,
            Err(e) => {
                self.state = ServiceState::Failed(e.to_string());
                return Err(e);
            }
        };
        self.open_with_backend(settings, keys, backend).await
    }

    /// Bind an already imported key to a backend and load its chat state.
    pub async fn open_with_backend(
        &mut self,
        settings: WalletSettings,
        keys: KeyPair,
        backend: Arc<dyn ChainBackend>,
    ) -> Result<Arc<ChainScanner>> {
        self.state = ServiceState::Loading;
        match self.try_open(settings, keys, backend).await {
            Ok(scanner) => {
                self.scanner = Some(scanner.clone());
                self.state = ServiceState::Ready;
                tracing::info!("🔓 Wallet ready: {}", scanner.address());
                Ok(scanner)
            }
            Err(e) => {
                self.state = ServiceState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn try_open(
        &self,
        settings: WalletSettings,
        keys: KeyPair,
        backend: Arc<dyn ChainBackend>,
    ) -> Result<Arc<ChainScanner>> {
        let settings = settings.normalized();
        let address = keys::derive_address(keys.public_key(), &self.chain);
        let watch = backend::WatchAddress::new(address.clone(), keys::p2wpkh_script(keys.public_key()));

        let probe = match backend.watch_address(&watch).await {
            Ok(()) => backend.subscribe_tip().await,
            Err(e) => Err(e),
        };
        let tip = probe.map_err(|e| {
            let label = match backend.kind() {
                BackendKind::Indexer => "ElectrumX Connection Failed",
                BackendKind::Legacy => "Node Connection Failed",
            };
            ChatError::Connection(format!("{label}: {e}. (Key is valid locally)"))
        })?;
        tracing::info!("⛓️  Connected, chain tip at height {tip}");

        let store = ChatStore::new(self.kv.clone(), address, keys::derive_storage_key(keys.secret_key()));
        store.save_settings(&settings)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let scanner = Arc::new(ChainScanner::new(keys, self.chain.clone(), backend, store, settings, events)?);
        scanner.enforce_retention()?;
        Ok(scanner)
    }

    /// Seal the session key under a pass-phrase so `restore` can reopen it.
    pub fn remember(&self, passphrase: &str, params: KdfParams) -> Result<()> {
        let scanner = self.scanner()?;
        let wif = scanner.keys().to_wif(&self.chain);
        let sealed = crypto::seal_with_passphrase(passphrase, wif.as_bytes(), params)?;
        storage::save_keystore(self.kv.as_ref(), &sealed)?;
        tracing::info!("🔐 Session key saved to keystore");
        Ok(())
    }

    pub fn has_saved_session(&self) -> bool {
        matches!(storage::load_keystore(self.kv.as_ref()), Ok(Some(_)))
    }

    /// Reopen the session saved by `remember`. `None` when nothing is saved.
    pub async fn restore(&mut self, passphrase: &str) -> Result<Option<Arc<ChainScanner>>> {
        let Some(sealed) = storage::load_keystore(self.kv.as_ref())? else {
            return Ok(None);
        };
        let wif = crypto::open_with_passphrase(passphrase, &sealed)?;
        let wif = std::str::from_utf8(&wif)
            .map_err(|_| ChatError::Storage("keystore does not hold a WIF".into()))?
            .to_string();
        let wif = zeroize::Zeroizing::new(wif);
        let settings = self.settings();
        self.open(settings, &wif).await.map(Some)
    }

    /// Start the periodic scan and balance tasks for the open session.
    pub fn start_sync(&mut self, on_balance: Option<BalanceCallback>) -> Result<()> {
        let scanner = self.scanner()?;
        if self.sync_task.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.sync_task = Some(sync::spawn(scanner, self.sync_state.clone(), on_balance, shutdown_rx));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stop background work and drop the session key. `forget` also clears the keystore.
    pub async fn logout(&mut self, forget: bool) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.sync_task.take() {
            let _ = task.await;
        }
        if let Some(scanner) = self.scanner.take() {
            scanner.persist()?;
        }
        if forget {
            storage::clear_keystore(self.kv.as_ref())?;
        }
        if let Ok(mut st) = self.sync_state.lock() {
            *st = SyncState::default();
        }
        self.state = ServiceState::Uninitialized;
        tracing::info!("👋 Logged out{}", if forget { " and keystore cleared" } else { "" });
        Ok(())
    }
}
