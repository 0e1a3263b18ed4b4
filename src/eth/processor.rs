//! Message processor: maps each admitted context to exactly one reply
//!
//! Requests are decoded into their typed form, dispatched to the node over
//! JSON-RPC, and answered on the context. Transactions are followed with
//! receipt polling bounded by the configured wait; queries answer straight
//! from `eth_call`. Every path, including every failure path, replies:
//! a dropped context would leak from the in-flight tracker permanently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::KafkaBridgeConf;
use crate::eth::rpc::{
    eth_call, eth_get_transaction_count, eth_get_transaction_receipt, eth_send_transaction, EthRpc,
};
use crate::kafka::bridge::MessageHandler;
use crate::kafka::context::MsgContext;
use crate::messages::{
    DeployContract, QueryCall, QueryResult, Quantity, SendTransaction, TransactionCommon,
    TransactionSuccess, MSG_TYPE_DEPLOY_CONTRACT, MSG_TYPE_QUERY, MSG_TYPE_SEND_TRANSACTION,
};

/// Cadence of `eth_getTransactionReceipt` polls
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// JSON-RPC message processor
pub struct MsgProcessor {
    rpc: Arc<dyn EthRpc>,
    max_tx_wait: Duration,
    always_manage_nonce: bool,
}

impl MsgProcessor {
    pub fn new(rpc: Arc<dyn EthRpc>, conf: &KafkaBridgeConf) -> Self {
        Self {
            rpc,
            max_tx_wait: Duration::from_secs(conf.max_tx_wait_time),
            always_manage_nonce: conf.always_manage_nonce,
        }
    }
}

#[async_trait]
impl MessageHandler for MsgProcessor {
    async fn on_message(&self, ctx: Arc<MsgContext>) {
        // The dispatch loop must not wait on RPC work; each message gets
        // its own task, bounded by the in-flight ceiling upstream.
        let rpc = self.rpc.clone();
        let max_tx_wait = self.max_tx_wait;
        let always_manage_nonce = self.always_manage_nonce;
        tokio::spawn(async move {
            process(rpc, max_tx_wait, always_manage_nonce, ctx).await;
        });
    }
}

async fn process(
    rpc: Arc<dyn EthRpc>,
    max_tx_wait: Duration,
    always_manage_nonce: bool,
    ctx: Arc<MsgContext>,
) {
    match ctx.headers().msg_type.as_str() {
        MSG_TYPE_DEPLOY_CONTRACT => match ctx.unmarshal::<DeployContract>() {
            Ok(body) => {
                submit_transaction(&*rpc, max_tx_wait, always_manage_nonce, &ctx, body.tx, None)
                    .await
            }
            Err(e) => {
                ctx.send_error_reply(400, format!("invalid DeployContract request: {e}"))
                    .await
            }
        },
        MSG_TYPE_SEND_TRANSACTION => match ctx.unmarshal::<SendTransaction>() {
            Ok(body) => {
                if body.to.is_empty() {
                    ctx.send_error_reply(400, "SendTransaction requires a \"to\" address")
                        .await;
                    return;
                }
                let to = body.to.clone();
                submit_transaction(&*rpc, max_tx_wait, always_manage_nonce, &ctx, body.tx, Some(to))
                    .await
            }
            Err(e) => {
                ctx.send_error_reply(400, format!("invalid SendTransaction request: {e}"))
                    .await
            }
        },
        MSG_TYPE_QUERY => query(&*rpc, &ctx).await,
        other => {
            ctx.send_error_reply(400, format!("unknown message type \"{other}\""))
                .await
        }
    }
}

/// Submit a deploy or send request and poll for its receipt
async fn submit_transaction(
    rpc: &dyn EthRpc,
    max_tx_wait: Duration,
    always_manage_nonce: bool,
    ctx: &MsgContext,
    mut tx: TransactionCommon,
    to: Option<String>,
) {
    if tx.from.is_empty() {
        ctx.send_error_reply(400, "transaction requires a \"from\" address")
            .await;
        return;
    }

    // Assign the next nonce ourselves when asked to and none was supplied;
    // otherwise the node's own next-nonce behavior applies.
    if always_manage_nonce && tx.nonce.is_none() {
        match eth_get_transaction_count(rpc, &tx.from, "pending").await {
            Ok(nonce) => {
                debug!(from = %tx.from, nonce, "assigned predicted nonce");
                tx.nonce = Some(Quantity::Num(nonce));
            }
            Err(e) => {
                ctx.send_error_reply(500, format!("failed to fetch nonce for {}: {e}", tx.from))
                    .await;
                return;
            }
        }
    }

    let tx_object = match build_tx_object(&tx, to.as_deref()) {
        Ok(obj) => obj,
        Err(e) => {
            ctx.send_error_reply(400, e).await;
            return;
        }
    };

    let tx_hash = match eth_send_transaction(rpc, &tx_object).await {
        Ok(hash) => hash,
        Err(e) => {
            ctx.send_error_reply(500, format!("transaction submission failed: {e}"))
                .await;
            return;
        }
    };
    info!(tx_hash = %tx_hash, req_offset = %ctx.req_offset(), "transaction submitted");

    let deadline = tokio::time::Instant::now() + max_tx_wait;
    loop {
        match eth_get_transaction_receipt(rpc, &tx_hash).await {
            Ok(Some(receipt)) => {
                ctx.reply(TransactionSuccess {
                    tx_hash: tx_hash.clone(),
                    receipt,
                })
                .await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                ctx.send_error_reply_with_tx(
                    500,
                    format!("failed to query receipt: {e}"),
                    &tx_hash,
                )
                .await;
                return;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(tx_hash = %tx_hash, waited = ?max_tx_wait, "receipt not observed in time");
            ctx.send_error_reply_with_tx(
                504,
                format!(
                    "timed out waiting {}s for transaction receipt",
                    max_tx_wait.as_secs()
                ),
                &tx_hash,
            )
            .await;
            return;
        }
        tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
    }
}

/// Answer a read-only query from `eth_call`; no receipt is involved
async fn query(rpc: &dyn EthRpc, ctx: &MsgContext) {
    let call: QueryCall = match ctx.unmarshal() {
        Ok(call) => call,
        Err(e) => {
            ctx.send_error_reply(400, format!("invalid Query request: {e}"))
                .await;
            return;
        }
    };
    if call.to.is_empty() {
        ctx.send_error_reply(400, "Query requires a \"to\" address").await;
        return;
    }

    let mut obj = Map::new();
    if let Some(from) = &call.from {
        obj.insert("from".into(), json!(from));
    }
    obj.insert("to".into(), json!(call.to));
    if let Some(data) = &call.data {
        obj.insert("data".into(), json!(ensure_hex_prefix(data)));
    }
    if let Some(value) = &call.value {
        match value.to_eth_hex() {
            Ok(hex) => {
                obj.insert("value".into(), json!(hex));
            }
            Err(e) => {
                ctx.send_error_reply(400, e.to_string()).await;
                return;
            }
        }
    }

    match eth_call(rpc, &Value::Object(obj)).await {
        Ok(result) => ctx.reply(QueryResult { result }).await,
        Err(e) => {
            ctx.send_error_reply(500, format!("call failed: {e}"))
                .await
        }
    }
}

/// Assemble the JSON-RPC transaction object from the typed request
fn build_tx_object(tx: &TransactionCommon, to: Option<&str>) -> Result<Value, String> {
    let mut obj = Map::new();
    obj.insert("from".into(), json!(tx.from));
    if let Some(to) = to {
        obj.insert("to".into(), json!(to));
    }
    for (field, quantity) in [
        ("nonce", &tx.nonce),
        ("gas", &tx.gas),
        ("gasPrice", &tx.gas_price),
        ("value", &tx.value),
    ] {
        if let Some(q) = quantity {
            let hex = q
                .to_eth_hex()
                .map_err(|e| format!("bad \"{field}\" field: {e}"))?;
            obj.insert(field.into(), json!(hex));
        }
    }
    if let Some(data) = &tx.data {
        obj.insert("data".into(), json!(ensure_hex_prefix(data)));
    }
    if let Some(private_for) = &tx.private_for {
        obj.insert("privateFor".into(), json!(private_for));
    }
    if let Some(private_from) = &tx.private_from {
        obj.insert("privateFrom".into(), json!(private_from));
    }
    Ok(Value::Object(obj))
}

fn ensure_hex_prefix(data: &str) -> String {
    if data.starts_with("0x") {
        data.to_string()
    } else {
        format!("0x{data}")
    }
}
