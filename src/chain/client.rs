use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::chain::errors::RpcError;
use crate::chain::types::{BlockHeader, LogEntry, LogFilter};

/// JSON-RPC "method not found"; retrying will never help.
const METHOD_NOT_FOUND: i64 = -32601;

/// Read-only view of an EVM chain.
///
/// Implementations perform no retries of their own. Callers combine retries
/// with the adaptive range controller.
#[async_trait]
pub(crate) trait ChainClient: Send + Sync + Debug {
    /// Number and hash of the current chain head.
    async fn latest_head(&self) -> Result<BlockHeader, RpcError>;

    /// Header of block `number`, or `None` if the node cannot resolve it
    /// (not yet produced, or pruned).
    async fn header_at(&self, number: u64) -> Result<Option<BlockHeader>, RpcError>;

    /// All logs in the inclusive range `[from, to]`, in node order.
    async fn logs(&self, from: u64, to: u64, filter: &LogFilter)
        -> Result<Vec<LogEntry>, RpcError>;
}

/// [`ChainClient`] speaking plain JSON-RPC over HTTP.
#[derive(Debug)]
pub(crate) struct EvmRpcClient {
    http: reqwest::Client,
    rpc_url: String,
    next_id: AtomicU64,
}

impl EvmRpcClient {
    /// Creates a client whose every request is bounded by `timeout`.
    pub(crate) fn new(rpc_url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            rpc_url: rpc_url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let mut json: Value = resp.json().await?;

        if let Some(err) = json.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            let reason = format!("{method} returned error {code}: {message}");
            return Err(if code == METHOD_NOT_FOUND {
                RpcError::Permanent(reason)
            } else {
                RpcError::Transient(reason)
            });
        }

        match json.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(RpcError::Permanent(format!(
                "{method} response has neither result nor error"
            ))),
        }
    }

    async fn block_by_tag(&self, tag: String) -> Result<Option<BlockHeader>, RpcError> {
        let result = self
            .request("eth_getBlockByNumber", json!([tag, false]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result)?))
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    async fn latest_head(&self) -> Result<BlockHeader, RpcError> {
        self.block_by_tag("latest".to_string())
            .await?
            .ok_or_else(|| RpcError::Permanent("node returned no latest block".to_string()))
    }

    async fn header_at(&self, number: u64) -> Result<Option<BlockHeader>, RpcError> {
        self.block_by_tag(format!("{number:#x}")).await
    }

    async fn logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>, RpcError> {
        let mut query = json!({
            "fromBlock": format!("{from:#x}"),
            "toBlock": format!("{to:#x}"),
        });
        if !filter.addresses.is_empty() {
            let addresses: Vec<String> =
                filter.addresses.iter().map(|a| format!("{a:#x}")).collect();
            query["address"] = json!(addresses);
        }
        if let Some(topic0) = filter.topic0 {
            query["topics"] = json!([format!("{topic0:#x}")]);
        }

        let result = self.request("eth_getLogs", json!([query])).await?;
        let logs: Vec<LogEntry> = serde_json::from_value(result)?;
        debug!(from, to, count = logs.len(), "eth_getLogs");
        Ok(logs)
    }
}
