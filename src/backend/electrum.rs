//! Electrum indexer client: line-delimited JSON-RPC over one shared TLS/TCP stream.

use super::{BackendKind, ChainBackend, HistoryEntry, HistoryWindow, Utxo, WatchAddress};
use crate::config::BackendConfig;
use crate::crypto;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use bitcoin::Amount;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

const CLIENT_NAME: &str = "palladium-secure-chat";
const PROTOCOL_VERSION: &str = "1.4";

struct Outbound {
    id: u64,
    method: String,
    line: String,
    reply: oneshot::Sender<Result<Value>>,
}

type Pending = HashMap<u64, (String, oneshot::Sender<Result<Value>>)>;

pub struct ElectrumBackend {
    cfg: BackendConfig,
    conn: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    next_id: AtomicU64,
    server_version: std::sync::Mutex<Option<Value>>,
}

#[derive(Deserialize)]
struct ListUnspentItem {
    tx_hash: String,
    tx_pos: u32,
    value: u64,
    #[serde(default)]
    height: i64,
}

#[derive(Deserialize)]
struct HistoryItem {
    tx_hash: String,
    #[serde(default)]
    height: i64,
}

#[derive(Deserialize)]
struct HeaderTip {
    height: u64,
}

impl ElectrumBackend {
    pub fn new(cfg: BackendConfig) -> Result<Self> {
        Ok(Self {
            cfg,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
            server_version: std::sync::Mutex::new(None),
        })
    }

    /// Version pair agreed with the server during the handshake, if any.
    pub fn server_version(&self) -> Option<Value> {
        self.server_version.lock().ok().and_then(|v| v.clone())
    }

    async fn sender(&self) -> Result<mpsc::UnboundedSender<Outbound>> {
        let mut guard = self.conn.lock().await;
        if let Some(tx) = guard.as_ref() {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
            tracing::debug!("🔁 Electrum connection dropped, reconnecting");
        }
        let tx = self.open_connection().await?;
        self.handshake(&tx).await?;
        *guard = Some(tx.clone());
        Ok(tx)
    }

    async fn open_connection(&self) -> Result<mpsc::UnboundedSender<Outbound>> {
        let addr = format!("{}:{}", self.cfg.host, self.cfg.port);
        let tcp = tokio::time::timeout(self.timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| ChatError::Connection(format!("connect to {addr} timed out")))?
            .map_err(|e| ChatError::Connection(format!("connect to {addr}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if self.cfg.tls {
            let config = crypto::tls_client_config(self.cfg.accept_invalid_certs)?;
            let name = ServerName::try_from(self.cfg.host.clone())
                .map_err(|e| ChatError::Connection(format!("invalid server name: {e}")))?;
            let stream = TlsConnector::from(config)
                .connect(name, tcp)
                .await
                .map_err(|e| ChatError::Connection(format!("TLS handshake with {addr}: {e}")))?;
            tokio::spawn(run_connection(stream, rx));
        } else {
            tokio::spawn(run_connection(tcp, rx));
        }
        tracing::info!("🔗 Connected to Electrum server {addr}");
        Ok(tx)
    }

    /// `server.version` once per connection. A server-side error still counts as agreed.
    async fn handshake(&self, tx: &mpsc::UnboundedSender<Outbound>) -> Result<()> {
        match self.call(tx, "server.version", json!([CLIENT_NAME, PROTOCOL_VERSION])).await {
            Ok(v) => {
                tracing::debug!("🤝 Electrum server version {v}");
                if let Ok(mut slot) = self.server_version.lock() {
                    *slot = Some(v);
                }
                Ok(())
            }
            Err(ChatError::Rpc(msg)) => {
                tracing::debug!("🤝 server.version refused ({msg}), keeping defaults");
                if let Ok(mut slot) = self.server_version.lock() {
                    if slot.is_none() {
                        *slot = Some(json!([CLIENT_NAME, PROTOCOL_VERSION]));
                    }
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.timeout_secs.max(1))
    }

    async fn call(&self, tx: &mpsc::UnboundedSender<Outbound>, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string();
        let (reply, rx) = oneshot::channel();
        tx.send(Outbound { id, method: method.to_string(), line, reply })
            .map_err(|_| ChatError::Connection("Electrum connection closed".into()))?;

        match tokio::time::timeout(self.timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatError::Connection("Electrum connection closed".into())),
            Err(_) => Err(ChatError::Connection(format!("{method} timed out"))),
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if method == "server.version" {
            if let Some(v) = self.server_version() {
                return Ok(v);
            }
        }
        let tx = self.sender().await?;
        self.call(&tx, method, params).await
    }
}

/// Owns the socket. Exits on close or error, failing everything still pending.
async fn run_connection<S>(stream: S, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    let mut pending: Pending = HashMap::new();

    let reason = loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(out) = cmd else { break "client dropped".to_string() };
                let mut bytes = out.line.into_bytes();
                bytes.push(b'\n');
                if let Err(e) = write_half.write_all(&bytes).await {
                    let _ = out.reply.send(Err(ChatError::Connection(format!("write failed: {e}"))));
                    break format!("write failed: {e}");
                }
                sweep_abandoned(&mut pending);
                pending.insert(out.id, (out.method, out.reply));
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => dispatch(&text, &mut pending),
                    Ok(None) => break "Electrum connection closed".to_string(),
                    Err(e) => break format!("Electrum connection error: {e}"),
                }
            }
        }
    };

    // Close first so the next request sees a dead sender and reconnects.
    rx.close();
    while let Ok(out) = rx.try_recv() {
        let _ = out.reply.send(Err(ChatError::Connection(reason.clone())));
    }
    if !pending.is_empty() {
        tracing::warn!("⚠️  {reason}; failing {} pending request(s)", pending.len());
    }
    for (_, (_, reply)) in pending.drain() {
        let _ = reply.send(Err(ChatError::Connection(reason.clone())));
    }
}

/// Drop requests whose caller stopped waiting, e.g. after a timeout.
fn sweep_abandoned(pending: &mut Pending) -> usize {
    let before = pending.len();
    pending.retain(|_, (_, reply)| !reply.is_closed());
    let dropped = before - pending.len();
    if dropped > 0 {
        tracing::debug!("🧹 Dropped {dropped} abandoned Electrum request(s)");
    }
    dropped
}

fn dispatch(text: &str, pending: &mut Pending) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("ignoring unparseable Electrum line");
        return;
    };
    // Notifications carry no id.
    let Some(id) = msg.get("id").and_then(Value::as_u64) else { return };
    let Some((method, reply)) = pending.remove(&id) else { return };

    let result = match msg.get("error").filter(|e| !e.is_null()) {
        Some(err) => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| err.as_str().map(str::to_string))
                .unwrap_or_else(|| "Electrum error".to_string());
            tracing::debug!("Electrum {method} failed: {message}");
            Err(ChatError::Rpc(message))
        }
        None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = reply.send(result);
}

#[async_trait]
impl ChainBackend for ElectrumBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Indexer
    }

    async fn list_unspent(&self, addr: &WatchAddress) -> Result<Vec<Utxo>> {
        let v = self.request("blockchain.scripthash.listunspent", json!([addr.scripthash()])).await?;
        let items: Vec<ListUnspentItem> = serde_json::from_value(v)?;
        Ok(items
            .into_iter()
            .map(|u| Utxo { txid: u.tx_hash, vout: u.tx_pos, amount: Amount::from_sat(u.value), height: u.height })
            .collect())
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>> {
        let v = self.request("blockchain.transaction.get", json!([txid, false])).await?;
        let hex_str = v
            .as_str()
            .ok_or_else(|| ChatError::Decode(format!("transaction {txid}: expected hex string")))?;
        hex::decode(hex_str).map_err(|e| ChatError::Decode(format!("transaction {txid}: {e}")))
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String> {
        let v = self
            .request("blockchain.transaction.broadcast", json!([hex::encode(raw_tx)]))
            .await
            .map_err(|e| match e {
                ChatError::Rpc(msg) => ChatError::Broadcast(msg),
                other => other,
            })?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ChatError::Broadcast(format!("unexpected broadcast result: {v}")))
    }

    async fn get_history(&self, addr: &WatchAddress, _window: HistoryWindow) -> Result<Vec<HistoryEntry>> {
        let v = self.request("blockchain.scripthash.get_history", json!([addr.scripthash()])).await?;
        let items: Vec<HistoryItem> = serde_json::from_value(v)?;
        Ok(items
            .into_iter()
            .map(|h| HistoryEntry { txid: h.tx_hash, height: h.height, timestamp: None })
            .collect())
    }

    async fn subscribe_tip(&self) -> Result<u64> {
        let v = self.request("blockchain.headers.subscribe", json!([])).await?;
        let tip: HeaderTip = serde_json::from_value(v)?;
        Ok(tip.height)
    }

    async fn address_status(&self, addr: &WatchAddress) -> Result<Option<String>> {
        let v = self.request("blockchain.scripthash.subscribe", json!([addr.scripthash()])).await?;
        Ok(v.as_str().map(str::to_string))
    }
}

impl std::fmt::Debug for ElectrumBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectrumBackend")
            .field("host", &self.cfg.host)
            .field("port", &self.cfg.port)
            .finish()
    }
}
