// Shared fixtures: an in-memory chain backend and helpers that build real signed chat transactions.
#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::{Amount, Transaction, TxOut};
use chainchat::backend::{BackendKind, ChainBackend, HistoryEntry, HistoryWindow, Utxo, WatchAddress};
use chainchat::codec;
use chainchat::config::WalletSettings;
use chainchat::error::{ChatError, Result};
use chainchat::keys::{self, ChainParams, KeyPair};
use chainchat::message::ChatEvent;
use chainchat::scanner::ChainScanner;
use chainchat::storage::{ChatStore, KvStore, MemoryStore};
use chainchat::transfer::{PrevoutSource, SpendInput, TransactionBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct ChainData {
    txs: HashMap<String, Vec<u8>>,
    history: HashMap<String, Vec<HistoryEntry>>,
    utxos: HashMap<String, Vec<Utxo>>,
    tip: u64,
    broadcasts: Vec<Vec<u8>>,
    fail_broadcast: Option<String>,
    fail_unspent: Option<String>,
    history_delay: Option<Duration>,
    fetches: usize,
}

/// Backend double: history, UTXOs and raw transactions keyed by address and txid.
pub struct MockChain {
    kind: BackendKind,
    data: Mutex<ChainData>,
}

impl MockChain {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self { kind, data: Mutex::new(ChainData { tip: 100, ..Default::default() }) })
    }

    pub fn set_tip(&self, tip: u64) {
        self.data.lock().unwrap().tip = tip;
    }

    /// Store `tx` and list it in the history of every address given.
    pub fn add_tx(&self, tx: &Transaction, height: i64, addresses: &[&str]) -> String {
        self.add_tx_at(tx, height, addresses, None)
    }

    /// Like `add_tx`, with a backend-reported receive time in seconds.
    pub fn add_tx_at(&self, tx: &Transaction, height: i64, addresses: &[&str], timestamp: Option<u64>) -> String {
        let txid = tx.compute_txid().to_string();
        let mut d = self.data.lock().unwrap();
        d.txs.insert(txid.clone(), encode::serialize(tx));
        for addr in addresses {
            let list = d.history.entry(addr.to_string()).or_default();
            list.retain(|h| h.txid != txid);
            list.push(HistoryEntry { txid: txid.clone(), height, timestamp });
        }
        txid
    }

    /// Move an already listed transaction to a new height.
    pub fn set_height(&self, txid: &str, height: i64) {
        let mut d = self.data.lock().unwrap();
        for list in d.history.values_mut() {
            for h in list.iter_mut().filter(|h| h.txid == txid) {
                h.height = height;
            }
        }
    }

    pub fn fund(&self, address: &str, txid_seed: u8, sat: u64, height: i64) {
        let mut d = self.data.lock().unwrap();
        d.utxos.entry(address.to_string()).or_default().push(Utxo {
            txid: hex::encode([txid_seed; 32]),
            vout: 0,
            amount: Amount::from_sat(sat),
            height,
        });
    }

    pub fn add_utxo(&self, address: &str, utxo: Utxo) {
        self.data.lock().unwrap().utxos.entry(address.to_string()).or_default().push(utxo);
    }

    pub fn fail_broadcast_with(&self, msg: &str) {
        self.data.lock().unwrap().fail_broadcast = Some(msg.to_string());
    }

    /// Make coin queries fail with a connection error until cleared with `None`.
    pub fn fail_unspent_with(&self, msg: Option<&str>) {
        self.data.lock().unwrap().fail_unspent = msg.map(str::to_string);
    }

    /// Stall every history query, as a slow server would.
    pub fn delay_history(&self, delay: Duration) {
        self.data.lock().unwrap().history_delay = Some(delay);
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.data
            .lock()
            .unwrap()
            .broadcasts
            .iter()
            .map(|raw| encode::deserialize(raw).unwrap())
            .collect()
    }

    pub fn fetches(&self) -> usize {
        self.data.lock().unwrap().fetches
    }
}

#[async_trait]
impl ChainBackend for MockChain {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn list_unspent(&self, addr: &WatchAddress) -> Result<Vec<Utxo>> {
        let d = self.data.lock().unwrap();
        if let Some(msg) = &d.fail_unspent {
            return Err(ChatError::Connection(msg.clone()));
        }
        Ok(d.utxos.get(&addr.address).cloned().unwrap_or_default())
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>> {
        let mut d = self.data.lock().unwrap();
        d.fetches += 1;
        d.txs
            .get(txid)
            .cloned()
            .ok_or_else(|| ChatError::Rpc("No such mempool or blockchain transaction".into()))
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String> {
        let mut d = self.data.lock().unwrap();
        if let Some(msg) = &d.fail_broadcast {
            return Err(ChatError::Broadcast(msg.clone()));
        }
        let tx: Transaction = encode::deserialize(raw_tx).map_err(|e| ChatError::Decode(e.to_string()))?;
        let txid = tx.compute_txid().to_string();
        d.txs.insert(txid.clone(), raw_tx.to_vec());
        d.broadcasts.push(raw_tx.to_vec());
        Ok(txid)
    }

    async fn get_history(&self, addr: &WatchAddress, _window: HistoryWindow) -> Result<Vec<HistoryEntry>> {
        let delay = self.data.lock().unwrap().history_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.data.lock().unwrap().history.get(&addr.address).cloned().unwrap_or_default())
    }

    async fn subscribe_tip(&self) -> Result<u64> {
        Ok(self.data.lock().unwrap().tip)
    }
}

pub fn chain() -> ChainParams {
    ChainParams::palladium()
}

/// A second handle on the same key (KeyPair is deliberately not Clone).
pub fn same_key(keys: &KeyPair) -> KeyPair {
    let chain = chain();
    keys::import(&keys.to_wif(&chain), &chain).unwrap()
}

pub fn address_of(keys: &KeyPair) -> String {
    keys::derive_address(keys.public_key(), &chain())
}

/// A signed chat transaction from `sender` to `recipient` paying `amount_sat`.
/// `seed` makes the spent outpoint, and so the txid, unique.
pub fn chat_tx(sender: &KeyPair, recipient: &KeyPair, text: &str, amount_sat: u64, seed: u8) -> Transaction {
    let chain = chain();
    let envelope = codec::encrypt(text, &recipient.public_hex(), sender.secret_key()).unwrap();
    let payload = codec::encode_envelope(&chain.message_tag, &envelope);
    signed_tx(sender, recipient, &payload, amount_sat, seed)
}

pub fn signed_tx(sender: &KeyPair, recipient: &KeyPair, payload: &[u8], amount_sat: u64, seed: u8) -> Transaction {
    let chain = chain();
    let builder = TransactionBuilder::new(sender, &chain);
    let utxo = Utxo {
        txid: hex::encode([seed; 32]),
        vout: 0,
        amount: Amount::from_sat(1_000_000),
        height: 1,
    };
    let input = SpendInput {
        utxo: utxo.clone(),
        source: PrevoutSource::WitnessOutput(TxOut { value: utxo.amount, script_pubkey: builder.own_script() }),
    };
    let mut tx = builder
        .build_unsigned(
            std::slice::from_ref(&input),
            payload,
            recipient.public_key(),
            Amount::from_sat(amount_sat),
            Some(Amount::from_sat(500_000)),
        )
        .unwrap();
    builder.sign(&mut tx, &[input]).unwrap();
    tx
}

pub struct Harness {
    pub scanner: ChainScanner,
    pub chain: Arc<MockChain>,
    pub kv: Arc<MemoryStore>,
    pub events: broadcast::Receiver<ChatEvent>,
}

pub fn scanner_for(keys: KeyPair, chain: Arc<MockChain>, kv: Arc<MemoryStore>, settings: WalletSettings) -> Harness {
    let params = self::chain();
    let store = ChatStore::new(
        kv.clone() as Arc<dyn KvStore>,
        keys::derive_address(keys.public_key(), &params),
        keys::derive_storage_key(keys.secret_key()),
    );
    let (tx, events) = broadcast::channel(64);
    let scanner = ChainScanner::new(keys, params, chain.clone(), store, settings, tx).unwrap();
    Harness { scanner, chain, kv, events }
}

pub fn harness(keys: KeyPair, kind: BackendKind) -> Harness {
    scanner_for(keys, MockChain::new(kind), Arc::new(MemoryStore::new()), WalletSettings::default())
}
