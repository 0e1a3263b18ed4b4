//! Webhooks->Kafka bridge: an HTTP receiver that turns webhook POSTs into
//! inbound-topic messages, for clients that prefer request-reply over
//! driving the log directly

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::WebhooksBridgeConf;
use crate::error::{BridgeError, Result};
use crate::kafka::client::new_raw_producer;

/// How long a webhook message may wait in the producer queue
const WEBHOOK_SEND_TIMEOUT: Duration = Duration::from_secs(30);

struct WebhookState {
    producer: FutureProducer,
    topic: String,
}

/// One Webhooks->Kafka bridge instance
pub struct WebhooksBridge {
    conf: WebhooksBridgeConf,
}

impl WebhooksBridge {
    /// Build a bridge from a validated configuration
    pub fn new(conf: WebhooksBridgeConf) -> Self {
        Self { conf }
    }

    /// Serve until the listener fails or the process is told to stop
    pub async fn run(&self) -> Result<()> {
        let producer = new_raw_producer(&self.conf.kafka)?;
        let state = Arc::new(WebhookState {
            producer,
            topic: self.conf.kafka.topic_in.clone(),
        });
        let app = Router::new()
            .route("/message", post(handle_message))
            .route("/status", get(handle_status))
            .layer(DefaultBodyLimit::max(self.conf.max_msg_size))
            .with_state(state);

        let addr: SocketAddr = format!("{}:{}", self.conf.http.local_addr, self.conf.http.port)
            .parse()
            .map_err(|e| {
                BridgeError::Config(format!(
                    "invalid webhook listen address {}:{}: {e}",
                    self.conf.http.local_addr, self.conf.http.port
                ))
            })?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Connect(format!("failed to bind {addr}: {e}")))?;
        info!(%addr, topic = %self.conf.kafka.topic_in, "webhooks bridge listening");
        axum::serve(listener, app).await.map_err(BridgeError::Io)?;
        Ok(())
    }
}

async fn handle_status() -> Json<Value> {
    Json(json!({"ok": true}))
}

/// Accept one webhook request and forward it to the inbound topic. The
/// caller gets the request ID back; the reply itself arrives on the
/// outbound topic once the Kafka bridge has processed the message.
async fn handle_message(
    State(state): State<Arc<WebhookState>>,
    body: Bytes,
) -> std::result::Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut msg: Value = serde_json::from_slice(&body).map_err(|e| {
        bad_request(format!("unable to parse message body as JSON: {e}"))
    })?;
    if !msg.is_object() {
        return Err(bad_request("message body must be a JSON object".to_string()));
    }

    let msg_type = msg
        .pointer("/headers/msgType")
        .and_then(Value::as_str)
        .unwrap_or("");
    if msg_type.is_empty() {
        return Err(bad_request("message requires headers.msgType".to_string()));
    }

    // Mint the request ID here so the caller can correlate the eventual
    // reply even when it never chose an ID itself
    let id = match msg.pointer("/headers/id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let id = Uuid::new_v4().to_string();
            msg["headers"]["id"] = json!(id);
            id
        }
    };
    let key = msg
        .pointer("/headers/account")
        .and_then(Value::as_str)
        .filter(|a| !a.is_empty())
        .unwrap_or(&id)
        .to_string();

    let payload = serde_json::to_vec(&msg)
        .map_err(|e| server_error(format!("failed to re-encode message: {e}")))?;

    match state
        .producer
        .send(
            FutureRecord::to(&state.topic).key(&key).payload(&payload),
            WEBHOOK_SEND_TIMEOUT,
        )
        .await
    {
        Ok((partition, offset)) => {
            info!(%id, partition, offset, "webhook message forwarded");
            Ok(Json(json!({"id": id, "sent": true})))
        }
        Err((e, _)) => {
            error!(%id, error = %e, "webhook message delivery failed");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({"sent": false, "error": e.to_string()})),
            ))
        }
    }
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"sent": false, "error": message})),
    )
}

fn server_error(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"sent": false, "error": message})),
    )
}
