//! Chain scanning, classification and the per-wallet chat state.

use crate::backend::{BackendKind, ChainBackend, HistoryEntry, HistoryWindow, WatchAddress};
use crate::codec;
use crate::config::WalletSettings;
use crate::error::{ChatError, Result};
use crate::fees;
use crate::keys::{self, ChainParams, KeyPair};
use crate::message::{
    now_ms, ChatEvent, Contact, Message, MessageKind, MessageStatus, PendingSend, ScanState, TxLifecycle,
    ANONYMOUS_CONTACT,
};
use crate::metrics;
use crate::storage::{ChatStore, MessageBook};
use crate::transfer::{self, SendRequest, TransactionBuilder};
use bitcoin::{Amount, ScriptBuf, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Everything the scanner persists, kept behind one lock.
#[derive(Debug, Default, Clone)]
pub struct ChatState {
    pub contacts: Vec<Contact>,
    pub messages: MessageBook,
    pub scan: ScanState,
    pub last_seen: BTreeMap<String, u64>,
    pub tip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub total: Amount,
    pub spendable: Amount,
    pub pending: Amount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub entries: usize,
    pub new_messages: usize,
    pub status_updates: usize,
    pub pending: usize,
}

/// What a transaction turned out to be once its outputs and first input were read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Ignored,
    SelfSent { recipient_address: String, amount: Option<Amount>, payload: String },
    Received { sender: Option<String>, amount: Option<Amount>, payload: String },
}

impl Classification {
    pub fn lifecycle(&self) -> TxLifecycle {
        match self {
            Classification::Ignored => TxLifecycle::Ignored,
            Classification::SelfSent { .. } => TxLifecycle::SelfSent,
            Classification::Received { sender: Some(_), .. } => TxLifecycle::ReceivedKnown,
            Classification::Received { sender: None, .. } => TxLifecycle::ReceivedUnknownSender,
        }
    }
}

pub struct ChainScanner {
    keys: KeyPair,
    chain: ChainParams,
    backend: std::sync::Arc<dyn ChainBackend>,
    store: ChatStore,
    settings: Mutex<WalletSettings>,
    state: Mutex<ChatState>,
    tx_cache: Mutex<HashMap<String, Transaction>>,
    events: broadcast::Sender<ChatEvent>,
    own_address: String,
    own_script: ScriptBuf,
    own_hex: String,
}

impl std::fmt::Debug for ChainScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainScanner").field("own_address", &self.own_address).finish_non_exhaustive()
    }
}

impl ChainScanner {
    /// Load persisted state for this key and bind it to a backend.
    pub fn new(
        keys: KeyPair,
        chain: ChainParams,
        backend: std::sync::Arc<dyn ChainBackend>,
        store: ChatStore,
        settings: WalletSettings,
        events: broadcast::Sender<ChatEvent>,
    ) -> Result<Self> {
        let own_script = keys::p2wpkh_script(keys.public_key());
        let own_address = keys::derive_address(keys.public_key(), &chain);
        let own_hex = keys.public_hex();

        let state = ChatState {
            contacts: store.load_contacts()?,
            messages: store.load_messages()?,
            scan: store.load_scan_state()?,
            last_seen: store.load_last_seen()?,
            tip: 0,
        };
        tracing::debug!(
            "📂 Loaded {} contact(s), {} conversation(s), {} processed tx(s)",
            state.contacts.len(),
            state.messages.len(),
            state.scan.processed.len()
        );

        Ok(Self {
            keys,
            chain,
            backend,
            store,
            settings: Mutex::new(settings.normalized()),
            state: Mutex::new(state),
            tx_cache: Mutex::new(HashMap::new()),
            events,
            own_address,
            own_script,
            own_hex,
        })
    }

    pub fn address(&self) -> &str {
        &self.own_address
    }

    pub fn public_hex(&self) -> &str {
        &self.own_hex
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn chain(&self) -> &ChainParams {
        &self.chain
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn watch(&self) -> WatchAddress {
        WatchAddress::new(self.own_address.clone(), self.own_script.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> ChatState {
        self.state().clone()
    }

    pub fn settings(&self) -> WalletSettings {
        self.settings.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn update_settings(&self, settings: WalletSettings) -> Result<()> {
        let settings = settings.normalized();
        self.store.save_settings(&settings)?;
        if let Ok(mut slot) = self.settings.lock() {
            *slot = settings;
        }
        Ok(())
    }

    fn emit(&self, contact_id: &str, message: &Message, is_status_update: bool, is_inbound: bool) {
        // No subscribers is fine.
        let _ = self.events.send(ChatEvent {
            contact_id: contact_id.to_string(),
            message: message.clone(),
            is_status_update,
            is_inbound,
        });
    }

    /// Write contacts, messages, scan state and last-seen from a snapshot.
    pub fn persist(&self) -> Result<()> {
        let snap = self.snapshot();
        self.store.save_contacts(&snap.contacts)?;
        self.store.save_messages(&snap.messages)?;
        self.store.save_scan_state(&snap.scan)?;
        self.store.save_last_seen(&snap.last_seen)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transaction inspection
    // -------------------------------------------------------------------------

    async fn fetch_transaction(&self, txid: &str) -> Result<Transaction> {
        if let Some(tx) = self.tx_cache.lock().ok().and_then(|c| c.get(txid).cloned()) {
            return Ok(tx);
        }
        let raw = self.backend.get_raw_transaction(txid).await?;
        let tx = transfer::decode_transaction(&raw)?;
        metrics::TX_FETCHED.inc();
        if let Ok(mut cache) = self.tx_cache.lock() {
            cache.insert(txid.to_string(), tx.clone());
        }
        Ok(tx)
    }

    pub fn classify(&self, tx: &Transaction) -> Classification {
        let Some(payload) = transfer::extract_payload(tx, &self.chain.message_tag) else {
            return Classification::Ignored;
        };
        let sender = transfer::recover_sender(tx);

        if sender.as_deref() == Some(self.own_hex.as_str()) {
            return match transfer::recipient_output_info(tx, &self.own_address, &self.chain) {
                Some((recipient_address, amount)) => Classification::SelfSent {
                    recipient_address,
                    amount: transfer::reportable_amount(amount),
                    payload,
                },
                None => Classification::Ignored,
            };
        }

        match transfer::received_amount(tx, &self.own_script) {
            Some(amount) => Classification::Received {
                sender,
                amount: transfer::reportable_amount(amount),
                payload,
            },
            None => Classification::Ignored,
        }
    }

    fn decrypt(&self, payload: &str, counterparty_hex: &str) -> String {
        codec::decrypt_or_raw(payload, counterparty_hex, self.keys.secret_key())
    }

    // -------------------------------------------------------------------------
    // State mutations (each takes the lock once and never across an await)
    // -------------------------------------------------------------------------

    /// Re-derive the status of every stored message with this id.
    fn refresh_status(&self, txid: &str, status: MessageStatus, allow_regress: bool) -> usize {
        let mut changed = Vec::new();
        {
            let mut st = self.state();
            for (contact_id, list) in st.messages.iter_mut() {
                for msg in list.iter_mut().filter(|m| m.id == txid) {
                    let upgrade = status > msg.status;
                    if msg.status != status && (upgrade || allow_regress) {
                        msg.status = status;
                        changed.push((contact_id.clone(), msg.clone()));
                    }
                }
            }
        }
        for (contact_id, msg) in &changed {
            self.emit(contact_id, msg, true, false);
        }
        changed.len()
    }

    fn is_known(&self, txid: &str) -> (bool, bool) {
        let st = self.state();
        let listed = st.messages.values().any(|list| list.iter().any(|m| m.id == txid));
        (st.scan.processed.contains(txid), listed)
    }

    fn mark_processed(&self, txid: &str) {
        let mut st = self.state();
        st.scan.processed.insert(txid.to_string());
        st.scan.pending.remove(txid);
    }

    /// Append unless the id is already in this contact's list. Returns true if appended.
    fn append_message(&self, contact_id: &str, message: Message, bump_unread: bool) -> bool {
        let inbound = !message.is_outgoing();
        let appended = {
            let mut st = self.state();
            st.scan.processed.insert(message.id.clone());
            st.scan.pending.remove(&message.id);
            let list = st.messages.entry(contact_id.to_string()).or_default();
            if list.iter().any(|m| m.id == message.id) {
                false
            } else {
                list.push(message.clone());
                if bump_unread {
                    if let Some(c) = st.contacts.iter_mut().find(|c| c.id == contact_id) {
                        c.unread = c.unread.saturating_add(1);
                    }
                }
                true
            }
        };
        if appended {
            if inbound {
                metrics::MESSAGES_RECEIVED.inc();
            }
            self.emit(contact_id, &message, false, inbound);
        }
        appended
    }

    fn contact_by_address(&self, address: &str) -> Option<Contact> {
        self.state().contacts.iter().find(|c| c.address == address).cloned()
    }

    fn contact_exists(&self, id: &str) -> bool {
        self.state().contacts.iter().any(|c| c.id == id)
    }

    // -------------------------------------------------------------------------
    // Scanning
    // -------------------------------------------------------------------------

    fn history_window(&self) -> HistoryWindow {
        match self.backend.kind() {
            BackendKind::Indexer => HistoryWindow::Full,
            BackendKind::Legacy => HistoryWindow::RecentHours(self.settings().rescan_hours),
        }
    }

    /// One pass over the wallet's history. `force` re-derives everything from chain truth.
    pub async fn scan_tick(&self, force: bool) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        if force {
            tracing::info!("🔄 Forced rescan: clearing processed set and pending entries");
            self.state().scan.reset();
            self.store.save_scan_state(&self.snapshot().scan)?;
            if self.backend.kind() == BackendKind::Indexer {
                let contact_ids: Vec<String> = self.state().contacts.iter().map(|c| c.id.clone()).collect();
                for id in contact_ids {
                    report.new_messages += self.scan_contact_history(&id).await?;
                }
            }
        }

        let watch = self.watch();
        if let Some(status) = self.backend.address_status(&watch).await? {
            self.state().scan.cursor = Some(status);
        }
        let history = self.backend.get_history(&watch, self.history_window()).await?;
        let tip = self.backend.subscribe_tip().await?;
        self.state().tip = tip;
        report.entries = history.len();

        for entry in &history {
            match self.process_entry(entry, tip, force).await {
                Ok((stage, updates)) => {
                    report.status_updates += updates;
                    match stage {
                        TxLifecycle::Processed => {}
                        TxLifecycle::SelfSent | TxLifecycle::ReceivedKnown | TxLifecycle::ReceivedUnknownSender => {
                            report.new_messages += 1
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_connection() => return Err(e),
                Err(ChatError::Decode(msg)) => {
                    tracing::warn!("⚠️  Unreadable transaction {}: {msg}", entry.txid);
                    self.mark_processed(&entry.txid);
                }
                Err(e) => tracing::warn!("⚠️  Skipping {} this round: {e}", entry.txid),
            }
        }

        report.new_messages += self.resolve_pending();
        report.pending = self.state().scan.pending.len();
        self.persist()?;
        metrics::SCAN_TICKS.inc();
        if report.new_messages > 0 || report.status_updates > 0 {
            tracing::info!(
                "📬 Scan: {} new message(s), {} status update(s), {} pending",
                report.new_messages,
                report.status_updates,
                report.pending
            );
        }
        Ok(report)
    }

    /// Returns the stage the transaction ended in and how many statuses changed.
    /// New messages are reported as the classification they were appended under.
    async fn process_entry(&self, entry: &HistoryEntry, tip: u64, force: bool) -> Result<(TxLifecycle, usize)> {
        let status = MessageStatus::at_height(entry.height, tip);
        let updates = self.refresh_status(&entry.txid, status, force);

        let (processed, listed) = self.is_known(&entry.txid);
        if processed {
            return Ok((TxLifecycle::Processed, updates));
        }
        if listed {
            self.mark_processed(&entry.txid);
            return Ok((TxLifecycle::Processed, updates));
        }

        let tx = self.fetch_transaction(&entry.txid).await?;
        let classification = self.classify(&tx);
        let stage = classification.lifecycle();
        let timestamp = entry.timestamp.map(|s| s * 1000).unwrap_or_else(now_ms);

        match classification {
            Classification::Ignored => {
                self.mark_processed(&entry.txid);
                Ok((TxLifecycle::Processed, updates))
            }
            Classification::SelfSent { recipient_address, amount, payload } => {
                match self.contact_by_address(&recipient_address) {
                    Some(contact) => {
                        let message = Message {
                            id: entry.txid.clone(),
                            timestamp,
                            status,
                            text: self.decrypt(&payload, &contact.id),
                            kind: MessageKind::Outgoing { amount, fee: None, total_spent: None },
                        };
                        let appended = self.append_message(&contact.id, message, false);
                        Ok((if appended { stage } else { TxLifecycle::Processed }, updates))
                    }
                    None => {
                        tracing::debug!("⏳ {} waits for contact {recipient_address}", entry.txid);
                        self.state().scan.pending.insert(
                            entry.txid.clone(),
                            PendingSend { recipient_address, payload, amount, timestamp, height: entry.height },
                        );
                        Ok((TxLifecycle::PendingContactResolution, updates))
                    }
                }
            }
            Classification::Received { sender, amount, payload } => {
                let (bucket, text) = match &sender {
                    Some(hex) => (hex.clone(), self.decrypt(&payload, hex)),
                    None => (ANONYMOUS_CONTACT.to_string(), payload),
                };
                let message = Message {
                    id: entry.txid.clone(),
                    timestamp,
                    status,
                    text,
                    kind: MessageKind::Incoming { amount },
                };
                let bump = self.contact_exists(&bucket);
                let appended = self.append_message(&bucket, message, bump);
                Ok((if appended { stage } else { TxLifecycle::Processed }, updates))
            }
        }
    }

    /// Attach pending self-sent transactions whose recipient is now a contact.
    pub fn resolve_pending(&self) -> usize {
        let (pending, tip) = {
            let st = self.state();
            (st.scan.pending.clone(), st.tip)
        };
        let mut resolved = 0;
        for (txid, p) in pending {
            let Some(contact) = self.contact_by_address(&p.recipient_address) else { continue };
            let message = Message {
                id: txid.clone(),
                timestamp: p.timestamp,
                status: MessageStatus::at_height(p.height, tip),
                text: self.decrypt(&p.payload, &contact.id),
                kind: MessageKind::Outgoing { amount: p.amount, fee: None, total_spent: None },
            };
            if self.append_message(&contact.id, message, false) {
                tracing::info!("🔗 Pending message {txid} attached to {}", contact.name);
                resolved += 1;
            }
        }
        resolved
    }

    /// Walk a contact's own address history (indexer only). Returns messages added.
    pub async fn scan_contact_history(&self, contact_id: &str) -> Result<usize> {
        if self.backend.kind() != BackendKind::Indexer {
            return Ok(0);
        }
        let pubkey = keys::parse_public_key(contact_id)?;
        let watch = WatchAddress::new(keys::derive_address(&pubkey, &self.chain), keys::p2wpkh_script(&pubkey));
        let history = self.backend.get_history(&watch, HistoryWindow::Full).await?;
        let tip = self.backend.subscribe_tip().await?;

        let mut added = 0;
        for item in history {
            if self.is_known(&item.txid).0 {
                continue;
            }
            let status = MessageStatus::at_height(item.height, tip);
            let tx = match self.fetch_transaction(&item.txid).await {
                Ok(tx) => tx,
                Err(ChatError::Decode(msg)) => {
                    tracing::warn!("⚠️  Unreadable transaction {}: {msg}", item.txid);
                    self.mark_processed(&item.txid);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let timestamp = item.timestamp.map(|s| s * 1000).unwrap_or_else(now_ms);

            let appended = match self.classify(&tx) {
                Classification::Ignored => {
                    self.mark_processed(&item.txid);
                    false
                }
                Classification::SelfSent { amount, payload, .. } => {
                    let message = Message {
                        id: item.txid.clone(),
                        timestamp,
                        status,
                        text: self.decrypt(&payload, contact_id),
                        kind: MessageKind::Outgoing { amount, fee: None, total_spent: None },
                    };
                    self.append_message(contact_id, message, false)
                }
                Classification::Received { sender, amount, payload } => {
                    let bucket = sender.unwrap_or_else(|| contact_id.to_string());
                    let message = Message {
                        id: item.txid.clone(),
                        timestamp,
                        status,
                        text: self.decrypt(&payload, &bucket),
                        kind: MessageKind::Incoming { amount },
                    };
                    let bump = self.contact_exists(&bucket);
                    self.append_message(&bucket, message, bump)
                }
            };
            if appended {
                added += 1;
            }
        }

        self.persist()?;
        Ok(added)
    }

    // -------------------------------------------------------------------------
    // User operations
    // -------------------------------------------------------------------------

    /// Encrypt and broadcast `text` to `recipient_hex`, optionally paying `payment`.
    pub async fn send_message(&self, recipient_hex: &str, text: &str, payment: Option<Amount>) -> Result<Message> {
        let recipient = normalize_id(recipient_hex);
        keys::parse_public_key(&recipient)?;
        let settings = self.settings();
        let payment = payment.unwrap_or(Amount::from_sat(settings.default_amount_sat));

        let watch = self.watch();
        let candidates = if settings.allow_unconfirmed_spend {
            self.backend.list_unspent(&watch).await?
        } else {
            self.backend.list_confirmed_unspent(&watch).await?
        };

        let request = SendRequest {
            recipient_hex: recipient.clone(),
            text: text.to_string(),
            payment,
            fee_rate: settings.fee_rate,
        };
        let receipt = match TransactionBuilder::new(&self.keys, &self.chain)
            .send(self.backend.as_ref(), &candidates, &request)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if matches!(e, ChatError::Broadcast(_)) {
                    metrics::BROADCAST_FAILURES.inc();
                }
                return Err(e);
            }
        };

        let message = Message {
            id: receipt.txid.clone(),
            timestamp: now_ms(),
            status: MessageStatus::Sending,
            text: text.to_string(),
            kind: MessageKind::Outgoing {
                amount: (payment > Amount::ZERO).then_some(payment),
                fee: Some(receipt.fee),
                total_spent: Some(receipt.total_spent),
            },
        };
        self.append_message(&recipient, message.clone(), false);
        metrics::MESSAGES_SENT.inc();
        self.persist()?;
        Ok(message)
    }

    pub async fn balance(&self) -> Result<Balance> {
        let watch = self.watch();
        let (total, spendable) = match self.backend.kind() {
            BackendKind::Indexer => {
                let utxos = self.backend.list_unspent(&watch).await?;
                let confirmed: Vec<_> = utxos.iter().filter(|u| u.is_confirmed()).cloned().collect();
                (fees::total_of(&utxos), fees::total_of(&confirmed))
            }
            BackendKind::Legacy => {
                let total = fees::total_of(&self.backend.list_unspent(&watch).await?);
                let spendable = fees::total_of(&self.backend.list_confirmed_unspent(&watch).await?);
                (total, spendable)
            }
        };
        let balance = Balance {
            total,
            spendable,
            pending: total.checked_sub(spendable).unwrap_or(Amount::ZERO),
        };
        metrics::BALANCE_SAT.set(balance.total.to_sat() as i64);
        Ok(balance)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.state()
            .contacts
            .iter()
            .cloned()
            .map(|mut c| {
                if c.name.trim().is_empty() {
                    c.name = Contact::default_name(&c.id);
                }
                c
            })
            .collect()
    }

    fn upsert_contact(&self, id: &str, name: Option<&str>) -> Result<Contact> {
        let pubkey = keys::parse_public_key(id)?;
        let address = keys::derive_address(&pubkey, &self.chain);
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Contact::default_name(id));

        let contact = {
            let mut st = self.state();
            match st.contacts.iter_mut().find(|c| c.id == id) {
                Some(existing) => {
                    existing.name = name;
                    existing.clone()
                }
                None => {
                    let contact = Contact { id: id.to_string(), address, name, unread: 0 };
                    st.contacts.push(contact.clone());
                    contact
                }
            }
        };
        self.store.save_contacts(&self.snapshot().contacts)?;
        Ok(contact)
    }

    async fn after_contact_change(&self, id: &str) -> Result<()> {
        self.resolve_pending();
        self.persist()?;
        self.scan_contact_history(id).await?;
        Ok(())
    }

    /// Add a contact; an empty name becomes `...` plus the last four hex digits.
    pub async fn add_contact(&self, pubkey_hex: &str, name: Option<&str>) -> Result<Contact> {
        let id = normalize_id(pubkey_hex);
        let contact = self.upsert_contact(&id, name)?;
        tracing::info!("👤 Contact {} added", contact.name);
        self.after_contact_change(&id).await?;
        Ok(contact)
    }

    /// Rename, creating the contact if it does not exist yet (accepting an unknown sender).
    pub async fn rename_contact(&self, pubkey_hex: &str, name: &str) -> Result<Contact> {
        let id = normalize_id(pubkey_hex);
        let contact = self.upsert_contact(&id, Some(name))?;
        self.after_contact_change(&id).await?;
        Ok(contact)
    }

    /// Remove a contact together with its conversation.
    pub fn remove_contact(&self, pubkey_hex: &str) -> Result<bool> {
        let id = normalize_id(pubkey_hex);
        let removed = {
            let mut st = self.state();
            let before = st.contacts.len();
            st.contacts.retain(|c| c.id != id);
            let had_messages = st.messages.remove(&id).is_some();
            st.last_seen.remove(&id);
            before != st.contacts.len() || had_messages
        };
        self.persist()?;
        Ok(removed)
    }

    /// Conversation with one contact, oldest first.
    pub fn messages(&self, contact_id: &str) -> Vec<Message> {
        let id = if contact_id == ANONYMOUS_CONTACT { contact_id.to_string() } else { normalize_id(contact_id) };
        let mut list = self.state().messages.get(&id).cloned().unwrap_or_default();
        list.sort_by_key(|m| m.timestamp);
        list
    }

    /// Conversation ids with at least one message, including `anonymous`.
    pub fn conversations(&self) -> Vec<String> {
        self.state()
            .messages
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn last_seen(&self, contact_id: &str) -> Option<u64> {
        self.state().last_seen.get(&normalize_id(contact_id)).copied()
    }

    /// Record that everything up to `timestamp` has been read.
    pub fn mark_read(&self, contact_id: &str, timestamp: u64) -> Result<()> {
        let id = normalize_id(contact_id);
        let last_seen = {
            let mut st = self.state();
            st.last_seen.insert(id.clone(), timestamp);
            if let Some(c) = st.contacts.iter_mut().find(|c| c.id == id) {
                c.unread = 0;
            }
            st.last_seen.clone()
        };
        self.store.save_last_seen(&last_seen)?;
        self.store.save_contacts(&self.snapshot().contacts)?;
        Ok(())
    }

    /// Drop messages older than the retention window. Returns how many were removed.
    pub fn enforce_retention(&self) -> Result<usize> {
        let days = self.settings().retention_days;
        if days == 0 {
            return Ok(0);
        }
        let cutoff = now_ms().saturating_sub(u64::from(days) * DAY_MS);
        let removed = {
            let mut st = self.state();
            let mut removed = 0;
            for list in st.messages.values_mut() {
                let before = list.len();
                list.retain(|m| m.timestamp > cutoff);
                removed += before - list.len();
            }
            removed
        };
        if removed > 0 {
            tracing::info!("🧹 Retention removed {removed} message(s) older than {days} day(s)");
            self.store.save_messages(&self.snapshot().messages)?;
        }
        Ok(removed)
    }
}

fn normalize_id(id: &str) -> String {
    id.trim().to_lowercase()
}
