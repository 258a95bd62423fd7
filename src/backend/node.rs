//! Legacy full node over HTTP JSON-RPC 1.0 with basic auth.

use super::{BackendKind, ChainBackend, HistoryEntry, HistoryWindow, Utxo, WatchAddress};
use crate::config::BackendConfig;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use bitcoin::Amount;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;

const RPC_ID: &str = "palladium-client";
const WATCH_LABEL: &str = "palladium_chat_user";
const MAX_CONF: u64 = 9_999_999;

pub struct NodeBackend {
    url: String,
    user: String,
    pass: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

#[derive(Deserialize)]
struct NodeUnspent {
    txid: String,
    vout: u32,
    amount: f64,
    #[serde(default)]
    confirmations: i64,
}

#[derive(Deserialize)]
struct NodeTransaction {
    txid: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    confirmations: i64,
    #[serde(default)]
    timereceived: Option<u64>,
}

#[derive(Deserialize)]
struct ChainInfo {
    blocks: u64,
    #[serde(default)]
    chain: String,
}

/// Height from a confirmation count: `tip - conf + 1`, or 0 while unconfirmed.
pub fn height_from_confirmations(confirmations: i64, tip: u64) -> i64 {
    if confirmations > 0 {
        (tip as i64 - confirmations + 1).max(1)
    } else {
        0
    }
}

impl NodeBackend {
    pub fn new(cfg: BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| ChatError::Connection(format!("http client: {e}")))?;
        let scheme = if cfg.tls { "https" } else { "http" };
        Ok(Self {
            url: format!("{scheme}://{}:{}", cfg.host, cfg.port),
            user: cfg.user,
            pass: cfg.pass,
            client,
        })
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({ "jsonrpc": "1.0", "id": RPC_ID, "method": method, "params": params });
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        // Nodes report RPC errors with a 500 and a JSON body; prefer the body.
        let parsed: RpcResponse = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(_) if !status.is_success() => {
                return Err(ChatError::Connection(format!("HTTP {}: {}", status.as_u16(), text.trim())));
            }
            Err(e) => return Err(e.into()),
        };
        if !parsed.error.is_null() {
            let message = parsed
                .error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| parsed.error.to_string());
            return Err(ChatError::Rpc(message));
        }
        Ok(parsed.result)
    }

    async fn unspent(&self, addr: &WatchAddress, minconf: u64) -> Result<Vec<Utxo>> {
        let v = self
            .call("listunspent", json!([minconf, MAX_CONF, [addr.address.as_str()], true]))
            .await?;
        let items: Vec<NodeUnspent> = serde_json::from_value(v)?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let tip = self.subscribe_tip().await?;
        items
            .into_iter()
            .map(|u| {
                let amount = Amount::from_btc(u.amount)
                    .map_err(|e| ChatError::Decode(format!("amount {}: {e}", u.amount)))?;
                Ok(Utxo {
                    txid: u.txid,
                    vout: u.vout,
                    amount,
                    height: height_from_confirmations(u.confirmations, tip),
                })
            })
            .collect()
    }

    pub async fn chain_name(&self) -> Result<String> {
        let info: ChainInfo = serde_json::from_value(self.call("getblockchaininfo", json!([])).await?)?;
        Ok(info.chain)
    }
}

#[async_trait]
impl ChainBackend for NodeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    async fn list_unspent(&self, addr: &WatchAddress) -> Result<Vec<Utxo>> {
        self.unspent(addr, 0).await
    }

    async fn list_confirmed_unspent(&self, addr: &WatchAddress) -> Result<Vec<Utxo>> {
        self.unspent(addr, 1).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>> {
        let v = match self.call("getrawtransaction", json!([txid])).await {
            Ok(v) => v,
            // Without -txindex only wallet transactions can be fetched.
            Err(ChatError::Rpc(first)) => {
                tracing::debug!("getrawtransaction {txid} failed ({first}), trying gettransaction");
                let wallet_tx = self
                    .call("gettransaction", json!([txid, true]))
                    .await
                    .map_err(|_| ChatError::Rpc(first))?;
                wallet_tx.get("hex").cloned().unwrap_or(Value::Null)
            }
            Err(e) => return Err(e),
        };
        let hex_str = v
            .as_str()
            .ok_or_else(|| ChatError::Decode(format!("transaction {txid}: expected hex string")))?;
        hex::decode(hex_str).map_err(|e| ChatError::Decode(format!("transaction {txid}: {e}")))
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String> {
        let v = self
            .call("sendrawtransaction", json!([hex::encode(raw_tx)]))
            .await
            .map_err(|e| match e {
                ChatError::Rpc(msg) => ChatError::Broadcast(msg),
                other => other,
            })?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ChatError::Broadcast(format!("unexpected broadcast result: {v}")))
    }

    async fn get_history(&self, _addr: &WatchAddress, window: HistoryWindow) -> Result<Vec<HistoryEntry>> {
        let count = window.entry_count();
        let v = self.call("listtransactions", json!(["*", count, 0, true])).await?;
        let items: Vec<NodeTransaction> = serde_json::from_value(v)?;
        let tip = self.subscribe_tip().await?;

        let mut seen = HashSet::new();
        Ok(items
            .into_iter()
            .filter(|t| t.category == "send" || t.category == "receive")
            .filter(|t| seen.insert(t.txid.clone()))
            .map(|t| HistoryEntry {
                height: height_from_confirmations(t.confirmations, tip),
                timestamp: t.timereceived,
                txid: t.txid,
            })
            .collect())
    }

    async fn subscribe_tip(&self) -> Result<u64> {
        let info: ChainInfo = serde_json::from_value(self.call("getblockchaininfo", json!([])).await?)?;
        Ok(info.blocks)
    }

    async fn watch_address(&self, addr: &WatchAddress) -> Result<()> {
        if let Err(e) = self
            .call("importaddress", json!([addr.address, WATCH_LABEL, false]))
            .await
        {
            tracing::warn!("⚠️  Could not import watch-only address (maybe already exists): {e}");
        }
        Ok(())
    }
}
