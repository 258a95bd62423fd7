use crate::config::WalletSettings;
use crate::crypto;
use crate::error::{ChatError, Result};
use crate::message::{Contact, Message, ScanState};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

pub const NS_CONFIG: &str = "config";
pub const NS_KEYSTORE: &str = "keystore";
pub const NS_CONTACTS: &str = "contacts";
pub const NS_MESSAGES: &str = "messages";
pub const NS_SCAN: &str = "scan";
pub const NS_LAST_SEEN: &str = "last_seen";

pub const NAMESPACES: [&str; 6] = [NS_CONFIG, NS_KEYSTORE, NS_CONTACTS, NS_MESSAGES, NS_SCAN, NS_LAST_SEEN];

const SETTINGS_KEY: &[u8] = b"wallet_settings";
const KEYSTORE_KEY: &[u8] = b"session";

/// Opaque namespaced blob store.
pub trait KvStore: Send + Sync {
    fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, ns: &str, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, ns: &str, key: &[u8]) -> Result<()>;
    /// Every key in a namespace, in byte order.
    fn keys(&self, ns: &str) -> Result<Vec<Vec<u8>>>;
}

/// RocksDB-backed store, one column family per namespace.
pub struct Store {
    db: DB,
    path: String,
}

impl Store {
    pub fn open(base_path: &str) -> Result<Self> {
        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(8 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = std::iter::once("default")
            .chain(NAMESPACES)
            .map(|name| ColumnFamilyDescriptor::new(name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(4);
        db_opts.set_max_open_files(128);
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);

        std::fs::create_dir_all(base_path)
            .map_err(|e| ChatError::Storage(format!("create '{base_path}': {e}")))?;
        let db = DB::open_cf_descriptors(&db_opts, base_path, cf_descriptors)
            .map_err(|e| ChatError::Storage(format!("Failed to open database at '{base_path}': {e}")))?;

        let store = Store { db, path: base_path.to_string() };
        store.health_check()?;
        tracing::info!("✅ Store opened at {base_path}");
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Write, read back and delete a probe key.
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        let storage = |e: rocksdb::Error| ChatError::Storage(format!("health check: {e}"));
        self.db.put(test_key, b"ok").map_err(storage)?;
        let value = self.db.get(test_key).map_err(storage)?;
        if value.as_deref() != Some(b"ok".as_slice()) {
            return Err(ChatError::Storage("Database read/write consistency check failed".into()));
        }
        self.db.delete(test_key).map_err(storage)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| ChatError::Storage(format!("Failed to flush database: {e}")))?;
        if let Err(e) = self.db.flush_wal(true) {
            tracing::warn!("WAL flush failed (non-critical): {e}");
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }

    fn cf(&self, ns: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(ns)
            .ok_or_else(|| ChatError::Storage(format!("Column family '{ns}' not found")))
    }
}

impl KvStore for Store {
    fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(ns)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| ChatError::Storage(format!("GET {ns}: {e}")))
    }

    fn put(&self, ns: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(ns)?;
        self.db
            .put_cf_opt(cf, key, value, &WriteOptions::default())
            .map_err(|e| ChatError::Storage(format!("PUT {ns}: {e}")))
    }

    fn delete(&self, ns: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(ns)?;
        self.db
            .delete_cf(cf, key)
            .map_err(|e| ChatError::Storage(format!("DELETE {ns}: {e}")))
    }

    fn keys(&self, ns: &str) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(ns)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (k, _) = item.map_err(|e| ChatError::Storage(format!("ITER {ns}: {e}")))?;
            out.push(k.to_vec());
        }
        Ok(out)
    }
}

/// In-memory store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<(String, Vec<u8>), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, Vec<u8>), Vec<u8>>>> {
        self.inner.lock().map_err(|_| ChatError::Storage("memory store poisoned".into()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(&(ns.to_string(), key.to_vec())).cloned())
    }

    fn put(&self, ns: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.lock()?.insert((ns.to_string(), key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, ns: &str, key: &[u8]) -> Result<()> {
        self.lock()?.remove(&(ns.to_string(), key.to_vec()));
        Ok(())
    }

    fn keys(&self, ns: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(n, _)| n == ns)
            .map(|(_, k)| k.clone())
            .collect())
    }
}

/// Open the on-disk store, with a hint on the usual failure causes.
pub fn open(path: &Path) -> anyhow::Result<Arc<Store>> {
    let path_str = path.display().to_string();
    Store::open(&path_str).map(Arc::new).map_err(|e| {
        tracing::error!("❌ Database failed to open at '{path_str}': {e}");
        tracing::error!("💡 Check the directory is writable and no other chainchat process holds {path_str}/LOCK");
        anyhow::anyhow!(e)
    })
}

/// Messages grouped by contact id.
pub type MessageBook = BTreeMap<String, Vec<Message>>;

/// Typed persistence for one wallet, keyed by its address.
#[derive(Clone)]
pub struct ChatStore {
    kv: Arc<dyn KvStore>,
    owner: String,
    storage_key: Arc<Zeroizing<[u8; 32]>>,
}

impl ChatStore {
    pub fn new(kv: Arc<dyn KvStore>, owner: impl Into<String>, storage_key: Zeroizing<[u8; 32]>) -> Self {
        Self { kv, owner: owner.into(), storage_key: Arc::new(storage_key) }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn get_plain<T: DeserializeOwned>(&self, ns: &str, key: &[u8]) -> Result<Option<T>> {
        match self.kv.get(ns, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_plain<T: Serialize>(&self, ns: &str, key: &[u8], value: &T) -> Result<()> {
        self.kv.put(ns, key, &bincode::serialize(value)?)
    }

    /// Sealed records that no longer open are dropped with a warning.
    fn get_sealed<T: DeserializeOwned + Default>(&self, ns: &str) -> Result<T> {
        let Some(sealed) = self.kv.get(ns, self.owner.as_bytes())? else {
            return Ok(T::default());
        };
        let opened = crypto::open(&self.storage_key, &sealed)
            .and_then(|plain| bincode::deserialize::<T>(&plain).map_err(ChatError::from));
        match opened {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!("⚠️  Could not open local {ns} ({e}). Starting fresh.");
                Ok(T::default())
            }
        }
    }

    fn put_sealed<T: Serialize>(&self, ns: &str, value: &T) -> Result<()> {
        let plain = Zeroizing::new(bincode::serialize(value)?);
        let sealed = crypto::seal(&self.storage_key, &plain)?;
        self.kv.put(ns, self.owner.as_bytes(), &sealed)
    }

    pub fn load_settings(&self) -> Result<Option<WalletSettings>> {
        load_global_settings(self.kv.as_ref())
    }

    pub fn save_settings(&self, settings: &WalletSettings) -> Result<()> {
        save_global_settings(self.kv.as_ref(), settings)
    }

    pub fn load_contacts(&self) -> Result<Vec<Contact>> {
        Ok(self.get_plain(NS_CONTACTS, self.owner.as_bytes())?.unwrap_or_default())
    }

    pub fn save_contacts(&self, contacts: &[Contact]) -> Result<()> {
        self.put_plain(NS_CONTACTS, self.owner.as_bytes(), &contacts)
    }

    pub fn load_messages(&self) -> Result<MessageBook> {
        self.get_sealed(NS_MESSAGES)
    }

    pub fn save_messages(&self, book: &MessageBook) -> Result<()> {
        self.put_sealed(NS_MESSAGES, book)
    }

    pub fn load_scan_state(&self) -> Result<ScanState> {
        Ok(self.get_plain(NS_SCAN, self.owner.as_bytes())?.unwrap_or_default())
    }

    pub fn save_scan_state(&self, state: &ScanState) -> Result<()> {
        self.put_plain(NS_SCAN, self.owner.as_bytes(), state)
    }

    pub fn load_last_seen(&self) -> Result<BTreeMap<String, u64>> {
        self.get_sealed(NS_LAST_SEEN)
    }

    pub fn save_last_seen(&self, last_seen: &BTreeMap<String, u64>) -> Result<()> {
        self.put_sealed(NS_LAST_SEEN, last_seen)
    }
}

/// The passphrase-sealed WIF kept between sessions. Not owner-scoped: one per store.
pub fn load_keystore(kv: &dyn KvStore) -> Result<Option<Vec<u8>>> {
    kv.get(NS_KEYSTORE, KEYSTORE_KEY)
}

pub fn save_keystore(kv: &dyn KvStore, sealed: &[u8]) -> Result<()> {
    kv.put(NS_KEYSTORE, KEYSTORE_KEY, sealed)
}

pub fn clear_keystore(kv: &dyn KvStore) -> Result<()> {
    kv.delete(NS_KEYSTORE, KEYSTORE_KEY)
}

/// Persisted settings without an owner, for use before login.
pub fn load_global_settings(kv: &dyn KvStore) -> Result<Option<WalletSettings>> {
    match kv.get(NS_CONFIG, SETTINGS_KEY)? {
        Some(bytes) => Ok(Some(bincode::deserialize::<WalletSettings>(&bytes)?.normalized())),
        None => Ok(None),
    }
}

pub fn save_global_settings(kv: &dyn KvStore, settings: &WalletSettings) -> Result<()> {
    kv.put(NS_CONFIG, SETTINGS_KEY, &bincode::serialize(settings)?)
}

/// Owner addresses that have any persisted chat state.
pub fn owners(kv: &dyn KvStore) -> Result<Vec<String>> {
    let mut out = std::collections::BTreeSet::new();
    for ns in [NS_CONTACTS, NS_MESSAGES, NS_SCAN] {
        for key in kv.keys(ns)? {
            out.insert(String::from_utf8_lossy(&key).into_owned());
        }
    }
    Ok(out.into_iter().collect())
}

/// The parts of an owner's state that are stored without sealing.
pub fn read_plaintext(kv: &dyn KvStore, owner: &str) -> Result<(Vec<Contact>, ScanState)> {
    let contacts = match kv.get(NS_CONTACTS, owner.as_bytes())? {
        Some(bytes) => bincode::deserialize(&bytes)?,
        None => Vec::new(),
    };
    let scan = match kv.get(NS_SCAN, owner.as_bytes())? {
        Some(bytes) => bincode::deserialize(&bytes)?,
        None => ScanState::default(),
    };
    Ok((contacts, scan))
}
