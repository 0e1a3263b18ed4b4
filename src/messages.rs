//! Wire envelopes for inbound requests and outbound replies
//!
//! Every message on the log is a UTF-8 JSON document. Requests carry a
//! `headers` record with at minimum a `msgType`; the rest of the body is
//! type-specific and decoded lazily by the processor. Replies embed their
//! own `headers` record stamped with the request correlation fields.

use serde::de;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Request type: deploy a new contract
pub const MSG_TYPE_DEPLOY_CONTRACT: &str = "DeployContract";
/// Request type: send a transaction to an existing contract or account
pub const MSG_TYPE_SEND_TRANSACTION: &str = "SendTransaction";
/// Request type: read-only contract call
pub const MSG_TYPE_QUERY: &str = "Query";
/// Reply type: transaction mined, receipt attached
pub const MSG_TYPE_TRANSACTION_SUCCESS: &str = "TransactionSuccess";
/// Reply type: result of a read-only call
pub const MSG_TYPE_QUERY_RESULT: &str = "QueryResult";
/// Reply type: request failed
pub const MSG_TYPE_ERROR: &str = "Error";

/// Headers common to every inbound request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommonHeaders {
    /// Request ID; minted as a v4 UUID on admission when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Message type tag, drives processor dispatch
    pub msg_type: String,
    /// Hex account address; used as the reply partition key when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Opaque caller blob, echoed verbatim into the reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// The minimal parse target for any inbound request: just the headers.
/// The full body is re-decoded into a typed request by the processor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestCommon {
    #[serde(default)]
    pub headers: CommonHeaders,
}

/// Headers stamped onto every outbound reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplyHeaders {
    /// Freshly generated reply ID
    pub id: String,
    pub msg_type: String,
    /// The `id` of the request this reply answers
    pub req_id: String,
    /// Partition coordinate of the request: `"topic:partition:offset"`
    pub req_offset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// RFC3339 instant the request was received
    pub received: String,
    /// Seconds between receipt and reply
    pub elapsed: f64,
}

/// A typed reply body that can be wrapped in the standard envelope
pub trait Reply: Serialize {
    /// The `msgType` stamped into the reply headers
    fn msg_type(&self) -> &str;
}

/// Invalid numeric payload field
#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid quantity \"{0}\"")]
pub struct QuantityError(pub String);

/// An Ethereum quantity supplied either as a JSON number or as a string
/// (decimal or 0x-prefixed hex). Always sent to the node as hex.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Quantity {
    Num(u64),
    Str(String),
}

impl Quantity {
    /// Render as a 0x-prefixed hex quantity for JSON-RPC
    pub fn to_eth_hex(&self) -> Result<String, QuantityError> {
        match self {
            Quantity::Num(n) => Ok(format!("{:#x}", n)),
            Quantity::Str(s) => {
                let trimmed = s.trim();
                if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
                    if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Ok(format!("0x{}", hex.to_lowercase()));
                    }
                    return Err(QuantityError(s.clone()));
                }
                trimmed
                    .parse::<u64>()
                    .map(|n| format!("{:#x}", n))
                    .map_err(|_| QuantityError(s.clone()))
            }
        }
    }
}

/// Fields shared by deploy and send requests
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionCommon {
    /// Sender account; the node signs on our behalf
    pub from: String,
    pub nonce: Option<Quantity>,
    pub gas: Option<Quantity>,
    pub gas_price: Option<Quantity>,
    pub value: Option<Quantity>,
    /// ABI-encoded call data / constructor bytecode, hex
    pub data: Option<String>,
    /// Permissioned-chain recipients for private transactions
    pub private_for: Option<Vec<String>>,
    pub private_from: Option<String>,
}

/// Body of a `SendTransaction` request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendTransaction {
    #[serde(flatten)]
    pub tx: TransactionCommon,
    pub to: String,
}

/// Body of a `DeployContract` request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeployContract {
    #[serde(flatten)]
    pub tx: TransactionCommon,
}

/// Body of a `Query` request (maps to `eth_call`)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryCall {
    pub from: Option<String>,
    pub to: String,
    pub data: Option<String>,
    pub value: Option<Quantity>,
}

/// Receipt fields passed through from `eth_getTransactionReceipt`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionReceipt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_gas_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_index: Option<String>,
}

/// Successful transaction reply, carrying the mined receipt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSuccess {
    pub tx_hash: String,
    #[serde(flatten)]
    pub receipt: TransactionReceipt,
}

impl Reply for TransactionSuccess {
    fn msg_type(&self) -> &str {
        MSG_TYPE_TRANSACTION_SUCCESS
    }
}

/// Reply to a read-only query
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub result: Value,
}

impl Reply for QueryResult {
    fn msg_type(&self) -> &str {
        MSG_TYPE_QUERY_RESULT
    }
}

/// Standard error reply body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    pub status: u16,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// The undecodable inbound payload, echoed back for diagnosis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message: Option<String>,
}

impl ErrorReply {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: message.into(),
            tx_hash: None,
            original_message: None,
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        let hash = tx_hash.into();
        if !hash.is_empty() {
            self.tx_hash = Some(hash);
        }
        self
    }

    pub fn with_original(mut self, payload: &[u8]) -> Self {
        self.original_message = Some(String::from_utf8_lossy(payload).into_owned());
        self
    }
}

impl Reply for ErrorReply {
    fn msg_type(&self) -> &str {
        MSG_TYPE_ERROR
    }
}

/// Serialize a reply body and graft the stamped headers onto it.
/// The body must serialize to a JSON object.
pub fn encode_reply<R: Reply>(headers: &ReplyHeaders, body: &R) -> serde_json::Result<Vec<u8>> {
    let mut doc = serde_json::to_value(body)?;
    match doc.as_object_mut() {
        Some(obj) => {
            obj.insert("headers".to_string(), serde_json::to_value(headers)?);
        }
        None => {
            return Err(de::Error::custom("reply body must be a JSON object"));
        }
    }
    serde_json::to_vec(&doc)
}
