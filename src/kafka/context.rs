//! Per-message context: request headers, partition coordinates, timing,
//! and the capability to publish a reply

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::kafka::client::{InboundMessage, OutboundRecord, ReplySink};
use crate::messages::{encode_reply, CommonHeaders, ErrorReply, Reply, ReplyHeaders, RequestCommon};

#[derive(Debug, Default)]
struct ReplyState {
    reply_type: String,
    reply_time: Option<DateTime<Utc>>,
    reply_bytes: Vec<u8>,
}

/// State for one in-flight request.
///
/// Created when the dispatch loop admits a novel coordinate, shared with
/// the processor (which must call a reply method exactly once) and with the
/// producer success loop (which marks it complete). Removed from the
/// tracker when offset advancement reaches it.
pub struct MsgContext {
    req_offset: String,
    time_received: DateTime<Utc>,
    raw: InboundMessage,
    headers: CommonHeaders,
    key: String,
    complete: AtomicBool,
    reply_state: Mutex<ReplyState>,
    sink: ReplySink,
}

impl MsgContext {
    /// Build a context from a consumed message. Header decoding failures do
    /// NOT fail construction: the context still enters the tracker so that
    /// a synthetic error reply can drive the offset forward. The boolean
    /// reports whether the payload headers parsed cleanly.
    pub(crate) fn new(raw: InboundMessage, sink: ReplySink) -> (Self, bool) {
        let req_offset = raw.req_offset();
        let (mut headers, parsed) = match serde_json::from_slice::<RequestCommon>(&raw.value) {
            Ok(request) => (request.headers, true),
            Err(e) => {
                warn!(
                    req_offset = %req_offset,
                    error = %e,
                    "failed to decode message headers"
                );
                (CommonHeaders::default(), false)
            }
        };
        if headers.id.as_deref().map_or(true, str::is_empty) {
            headers.id = Some(Uuid::new_v4().to_string());
        }
        // Account keys keep replies for one account on one partition;
        // the request ID is the fallback and is never empty here.
        let key = match headers.account.as_deref() {
            Some(account) if !account.is_empty() => account.to_string(),
            _ => headers.id.clone().unwrap_or_default(),
        };
        let ctx = Self {
            req_offset,
            time_received: Utc::now(),
            raw,
            headers,
            key,
            complete: AtomicBool::new(false),
            reply_state: Mutex::new(ReplyState::default()),
            sink,
        };
        (ctx, parsed)
    }

    /// Parsed request headers
    pub fn headers(&self) -> &CommonHeaders {
        &self.headers
    }

    /// The partition coordinate string `"topic:partition:offset"`
    pub fn req_offset(&self) -> &str {
        &self.req_offset
    }

    /// Reply partition key: the account when set, the request ID otherwise
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn topic(&self) -> &str {
        &self.raw.topic
    }

    pub fn partition(&self) -> i32 {
        self.raw.partition
    }

    pub fn offset(&self) -> i64 {
        self.raw.offset
    }

    /// The original consumer message, retained for offset marking
    pub(crate) fn raw(&self) -> &InboundMessage {
        &self.raw
    }

    /// Decode the original message body into a typed request
    pub fn unmarshal<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.raw.value)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Called by the producer success loop once the reply is on the broker
    pub(crate) fn set_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    /// Send the standard error reply
    pub async fn send_error_reply(&self, status: u16, message: impl Into<String>) {
        self.send_error_reply_with_tx(status, message, "").await;
    }

    /// Send the standard error reply carrying a transaction hash, for
    /// failures after the transaction was already submitted
    pub async fn send_error_reply_with_tx(
        &self,
        status: u16,
        message: impl Into<String>,
        tx_hash: &str,
    ) {
        let message = message.into();
        warn!(context = %self, status, error = %message, "failed to process message");
        let body = ErrorReply::new(status, message)
            .with_tx_hash(tx_hash)
            .with_original(&self.raw.value);
        self.reply(body).await;
    }

    /// Build the reply envelope, serialize it, and hand it to the producer.
    ///
    /// Stamps the correlation headers (`reqId`, `reqOffset`, `context`),
    /// the receive timestamp and the elapsed seconds. Returns immediately;
    /// publication is confirmed asynchronously through the producer success
    /// stream. Must be called exactly once per admitted context.
    pub async fn reply<R: Reply>(&self, body: R) {
        let reply_time = Utc::now();
        let elapsed = (reply_time - self.time_received).num_milliseconds() as f64 / 1000.0;
        let headers = ReplyHeaders {
            id: Uuid::new_v4().to_string(),
            msg_type: body.msg_type().to_string(),
            req_id: self.headers.id.clone().unwrap_or_default(),
            req_offset: self.req_offset.clone(),
            context: self.headers.context.clone(),
            received: self.time_received.to_rfc3339_opts(SecondsFormat::Secs, true),
            elapsed,
        };
        let bytes = match encode_reply(&headers, &body) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(context = %self, error = %e, "failed to serialize reply");
                return;
            }
        };
        {
            let mut state = self.reply_state.lock();
            state.reply_type = headers.msg_type.clone();
            state.reply_time = Some(reply_time);
            state.reply_bytes = bytes.clone();
        }
        info!(context = %self, "sending reply");
        let record = OutboundRecord {
            key: self.key.clone(),
            value: bytes,
            req_offset: self.req_offset.clone(),
        };
        if self.sink.send(record).await.is_err() {
            // Producer gone means the bridge is collapsing; the unmarked
            // offset will redeliver this request on the next run.
            error!(context = %self, "producer input closed, reply dropped");
        }
    }

    /// Serialized reply retained between `reply()` and producer success
    #[cfg(test)]
    pub(crate) fn reply_bytes(&self) -> Vec<u8> {
        self.reply_state.lock().reply_bytes.clone()
    }
}

impl fmt::Display for MsgContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MsgContext[{}:{} reqOffset={} complete={} received={}",
            self.headers.msg_type,
            self.headers.id.as_deref().unwrap_or(""),
            self.req_offset,
            self.is_complete(),
            self.time_received.to_rfc3339_opts(SecondsFormat::Secs, true),
        )?;
        let state = self.reply_state.lock();
        if let Some(reply_time) = state.reply_time {
            write!(
                f,
                " replied={} replyType={}",
                reply_time.to_rfc3339_opts(SecondsFormat::Secs, true),
                state.reply_type,
            )?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::QueryResult;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn inbound(value: Value) -> InboundMessage {
        InboundMessage {
            topic: "in".into(),
            partition: 0,
            offset: 5,
            key: None,
            value: serde_json::to_vec(&value).unwrap(),
            timestamp: None,
        }
    }

    #[test]
    fn key_prefers_account() {
        let (tx, _rx) = mpsc::channel(1);
        let msg = inbound(json!({
            "headers": {"id": "A", "msgType": "SendTransaction", "account": "0xabc"}
        }));
        let (ctx, parsed) = MsgContext::new(msg, tx);
        assert!(parsed);
        assert_eq!(ctx.key(), "0xabc");
        assert_eq!(ctx.req_offset(), "in:0:5");
    }

    #[test]
    fn key_falls_back_to_id() {
        let (tx, _rx) = mpsc::channel(1);
        let msg = inbound(json!({"headers": {"id": "A", "msgType": "Query"}}));
        let (ctx, _) = MsgContext::new(msg, tx);
        assert_eq!(ctx.key(), "A");
    }

    #[test]
    fn missing_id_is_minted() {
        let (tx, _rx) = mpsc::channel(1);
        let msg = inbound(json!({"headers": {"msgType": "Query"}}));
        let (ctx, parsed) = MsgContext::new(msg, tx);
        assert!(parsed);
        let id = ctx.headers().id.clone().unwrap();
        assert_eq!(id.len(), 36);
        assert_eq!(ctx.key(), id);
    }

    #[test]
    fn unparseable_payload_still_constructs() {
        let (tx, _rx) = mpsc::channel(1);
        let msg = InboundMessage {
            topic: "in".into(),
            partition: 0,
            offset: 3,
            key: None,
            value: b"not json".to_vec(),
            timestamp: None,
        };
        let (ctx, parsed) = MsgContext::new(msg, tx);
        assert!(!parsed);
        assert!(ctx.headers().id.is_some());
    }

    #[tokio::test]
    async fn reply_stamps_correlation_headers() {
        let (tx, mut rx) = mpsc::channel(1);
        let msg = inbound(json!({
            "headers": {"id": "req-1", "msgType": "Query", "context": {"tag": 7}}
        }));
        let (ctx, _) = MsgContext::new(msg, tx);
        ctx.reply(QueryResult { result: json!("0x01") }).await;

        let record = rx.recv().await.unwrap();
        assert_eq!(record.req_offset, "in:0:5");
        assert_eq!(record.key, "req-1");
        let doc: Value = serde_json::from_slice(&record.value).unwrap();
        assert_eq!(doc["headers"]["reqId"], "req-1");
        assert_eq!(doc["headers"]["reqOffset"], "in:0:5");
        assert_eq!(doc["headers"]["msgType"], "QueryResult");
        assert_eq!(doc["headers"]["context"]["tag"], 7);
        assert_eq!(doc["result"], "0x01");
        assert!(doc["headers"]["elapsed"].as_f64().unwrap() >= 0.0);
        assert_eq!(record.value, ctx.reply_bytes());
    }

    #[tokio::test]
    async fn error_reply_carries_tx_hash_and_original() {
        let (tx, mut rx) = mpsc::channel(1);
        let msg = inbound(json!({"headers": {"id": "X", "msgType": "SendTransaction"}}));
        let (ctx, _) = MsgContext::new(msg, tx);
        ctx.send_error_reply_with_tx(504, "timed out waiting for receipt", "0xT")
            .await;

        let record = rx.recv().await.unwrap();
        let doc: Value = serde_json::from_slice(&record.value).unwrap();
        assert_eq!(doc["headers"]["msgType"], "Error");
        assert_eq!(doc["status"], 504);
        assert_eq!(doc["txHash"], "0xT");
        assert!(doc["originalMessage"].as_str().unwrap().contains("SendTransaction"));
    }
}
