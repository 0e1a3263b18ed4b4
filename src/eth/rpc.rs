//! Minimal JSON-RPC 2.0 client for Ethereum nodes
//!
//! The bridge only needs a handful of methods, all taking and returning
//! JSON documents, so the transport is a thin reqwest wrapper behind the
//! [`EthRpc`] trait. Tests substitute scripted implementations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::error::BridgeError;
use crate::messages::TransactionReceipt;

/// JSON-RPC request timeout
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure talking to the node, or a node-reported error
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("JSON-RPC error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),
}

/// An Ethereum JSON-RPC endpoint
#[async_trait]
pub trait EthRpc: Send + Sync {
    /// Invoke `method` with positional `params`, returning the `result`
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// HTTP-transport [`EthRpc`] implementation
pub struct HttpRpc {
    client: reqwest::Client,
    url: Url,
    next_id: AtomicU64,
}

impl HttpRpc {
    /// Build a client for the given endpoint URL. Connection establishment
    /// is lazy; a bad URL fails here, an unreachable node fails per call.
    pub fn connect(url: &str) -> Result<Self, BridgeError> {
        let url = Url::parse(url)
            .map_err(|e| BridgeError::Connect(format!("invalid JSON-RPC URL {url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| BridgeError::Connect(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl EthRpc for HttpRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, "JSON-RPC request");
        let response: Value = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(RpcError::Server {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::InvalidResponse("response carries no result".into()))
    }
}

/// `eth_sendTransaction`; returns the transaction hash
pub async fn eth_send_transaction(rpc: &dyn EthRpc, tx: &Value) -> Result<String, RpcError> {
    let result = rpc.call("eth_sendTransaction", json!([tx])).await?;
    result
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RpcError::InvalidResponse(format!("non-string transaction hash: {result}")))
}

/// `eth_getTransactionCount` for an account at the given block tag
pub async fn eth_get_transaction_count(
    rpc: &dyn EthRpc,
    account: &str,
    block: &str,
) -> Result<u64, RpcError> {
    let result = rpc
        .call("eth_getTransactionCount", json!([account, block]))
        .await?;
    let hex = result
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse(format!("non-string nonce: {result}")))?;
    parse_hex_u64(hex)
        .ok_or_else(|| RpcError::InvalidResponse(format!("unparseable nonce \"{hex}\"")))
}

/// `eth_getTransactionReceipt`; `None` until the transaction is mined
pub async fn eth_get_transaction_receipt(
    rpc: &dyn EthRpc,
    tx_hash: &str,
) -> Result<Option<TransactionReceipt>, RpcError> {
    let result = rpc
        .call("eth_getTransactionReceipt", json!([tx_hash]))
        .await?;
    if result.is_null() {
        return Ok(None);
    }
    serde_json::from_value(result)
        .map(Some)
        .map_err(|e| RpcError::InvalidResponse(format!("undecodable receipt: {e}")))
}

/// `eth_call` against the latest block
pub async fn eth_call(rpc: &dyn EthRpc, tx: &Value) -> Result<Value, RpcError> {
    rpc.call("eth_call", json!([tx, "latest"])).await
}

fn parse_hex_u64(value: &str) -> Option<u64> {
    let hex = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(hex, 16).ok()
}
