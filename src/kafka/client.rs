//! Log client abstraction: a partitioned consumer stream with offset
//! marking, and an async producer with success/error feedback streams
//!
//! The core of the bridge only sees [`LogConsumer`], [`ProducerChannels`]
//! and the detached record types below; rdkafka stays behind this module so
//! the test suite can substitute channel-backed mocks.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::KafkaCommonConf;
use crate::error::{BridgeError, Result};

/// Channel depth for the producer input and feedback streams
const PRODUCER_CHANNEL_DEPTH: usize = 128;
/// How long a reply may sit in the producer queue before delivery fails
const PRODUCER_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// A consumed message, detached from the client that read it
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// Broker timestamp, milliseconds since the epoch
    pub timestamp: Option<i64>,
}

impl InboundMessage {
    /// The partition coordinate string, the canonical identity of an
    /// in-flight message
    pub fn req_offset(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

/// A reply record handed to the producer. `req_offset` is the opaque
/// correlator echoed back on the success and error streams.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub req_offset: String,
}

/// Producer confirmation that a reply reached the broker
#[derive(Debug, Clone)]
pub struct DeliveryAck {
    pub req_offset: String,
}

/// Producer notification that a reply could not be delivered
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub req_offset: String,
    pub cause: String,
}

/// Sink used by message contexts to enqueue replies
pub type ReplySink = mpsc::Sender<OutboundRecord>;

/// The consumer half of the log client: a stream of inbound messages and
/// per-partition offset marking
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Next message from the subscribed topic, or `None` once the stream
    /// has closed
    async fn next(&self) -> Option<InboundMessage>;

    /// Record `msg` as the highest processed offset for its partition.
    /// Idempotent; the group commit happens on the broker's cadence.
    fn mark_offset(&self, msg: &InboundMessage) -> Result<()>;
}

/// The producer half of the log client: an input sink plus the success and
/// error feedback streams, correlated by `req_offset`
pub struct ProducerChannels {
    pub input: ReplySink,
    pub successes: mpsc::Receiver<DeliveryAck>,
    pub errors: mpsc::Receiver<DeliveryFailure>,
}

/// rdkafka-backed [`LogConsumer`]
pub struct KafkaLogConsumer {
    inner: StreamConsumer,
}

impl KafkaLogConsumer {
    /// Create a consumer subscribed to the bridge's inbound topic.
    /// Offset storage is manual; the committed offset never runs ahead of
    /// what [`LogConsumer::mark_offset`] has recorded.
    pub fn new(conf: &KafkaCommonConf) -> Result<Self> {
        let mut config = client_config(conf);
        config
            .set("group.id", &conf.consumer_group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000");
        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| BridgeError::Connect(format!("failed to create Kafka consumer: {e}")))?;
        consumer
            .subscribe(&[conf.topic_in.as_str()])
            .map_err(|e| BridgeError::Connect(format!("failed to subscribe to {}: {e}", conf.topic_in)))?;
        debug!(topic = %conf.topic_in, group = %conf.consumer_group, "Kafka consumer subscribed");
        Ok(Self { inner: consumer })
    }
}

#[async_trait]
impl LogConsumer for KafkaLogConsumer {
    async fn next(&self) -> Option<InboundMessage> {
        loop {
            match self.inner.recv().await {
                Ok(msg) => {
                    return Some(InboundMessage {
                        topic: msg.topic().to_string(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        key: msg.key().map(|k| k.to_vec()),
                        value: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
                        timestamp: msg.timestamp().to_millis(),
                    });
                }
                Err(e) => {
                    // Transient fetch errors are the broker's problem, not
                    // ours; keep the loop alive and let rebalancing settle.
                    warn!(error = %e, "Kafka consume error");
                }
            }
        }
    }

    fn mark_offset(&self, msg: &InboundMessage) -> Result<()> {
        self.inner
            .store_offset(&msg.topic, msg.partition, msg.offset)
            .map_err(BridgeError::Kafka)
    }
}

/// Create the outbound producer and bridge it onto channels.
///
/// One forwarding task drains the input sink; each record gets its own
/// delivery task so acknowledgements arrive as the broker confirms them,
/// in whatever order that happens.
pub fn spawn_producer(conf: &KafkaCommonConf) -> Result<ProducerChannels> {
    let producer: FutureProducer = client_config(conf)
        .set("message.timeout.ms", "30000")
        .create()
        .map_err(|e| BridgeError::Connect(format!("failed to create Kafka producer: {e}")))?;

    let topic_out = conf.topic_out.clone();
    let (input_tx, mut input_rx) = mpsc::channel::<OutboundRecord>(PRODUCER_CHANNEL_DEPTH);
    let (success_tx, success_rx) = mpsc::channel::<DeliveryAck>(PRODUCER_CHANNEL_DEPTH);
    let (error_tx, error_rx) = mpsc::channel::<DeliveryFailure>(PRODUCER_CHANNEL_DEPTH);

    tokio::spawn(async move {
        while let Some(record) = input_rx.recv().await {
            let producer = producer.clone();
            let topic = topic_out.clone();
            let success_tx = success_tx.clone();
            let error_tx = error_tx.clone();
            tokio::spawn(async move {
                let delivery = producer
                    .send(
                        FutureRecord::to(&topic).key(&record.key).payload(&record.value),
                        PRODUCER_QUEUE_TIMEOUT,
                    )
                    .await;
                match delivery {
                    Ok((partition, offset)) => {
                        debug!(
                            req_offset = %record.req_offset,
                            partition, offset, "reply delivered"
                        );
                        if success_tx
                            .send(DeliveryAck { req_offset: record.req_offset })
                            .await
                            .is_err()
                        {
                            debug!("producer success stream closed");
                        }
                    }
                    Err((e, _)) => {
                        error!(req_offset = %record.req_offset, error = %e, "reply delivery failed");
                        if error_tx
                            .send(DeliveryFailure {
                                req_offset: record.req_offset,
                                cause: e.to_string(),
                            })
                            .await
                            .is_err()
                        {
                            debug!("producer error stream closed");
                        }
                    }
                }
            });
        }
        debug!("producer input sink closed");
    });

    Ok(ProducerChannels {
        input: input_tx,
        successes: success_rx,
        errors: error_rx,
    })
}

/// Plain producer used by the webhooks sidecar to write inbound requests
pub fn new_raw_producer(conf: &KafkaCommonConf) -> Result<FutureProducer> {
    client_config(conf)
        .set("message.timeout.ms", "30000")
        .create()
        .map_err(|e| BridgeError::Connect(format!("failed to create Kafka producer: {e}")))
}

/// Assemble the rdkafka client config shared by consumers and producers,
/// including the TLS and SASL settings
fn client_config(conf: &KafkaCommonConf) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", conf.brokers.join(","));
    if !conf.client_id.is_empty() {
        config.set("client.id", &conf.client_id);
    }

    let sasl = conf.sasl.username.is_some() && conf.sasl.password.is_some();
    let protocol = match (conf.tls.enabled, sasl) {
        (true, true) => "sasl_ssl",
        (true, false) => "ssl",
        (false, true) => "sasl_plaintext",
        (false, false) => "plaintext",
    };
    config.set("security.protocol", protocol);

    if conf.tls.enabled {
        if let Some(ca) = &conf.tls.ca_cert {
            config.set("ssl.ca.location", ca);
        }
        if let Some(cert) = &conf.tls.client_cert {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(key) = &conf.tls.client_key {
            config.set("ssl.key.location", key);
        }
        if conf.tls.insecure_skip_verify {
            config.set("enable.ssl.certificate.verification", "false");
        }
    }
    if sasl {
        config.set("sasl.mechanisms", "PLAIN");
        if let Some(username) = &conf.sasl.username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &conf.sasl.password {
            config.set("sasl.password", password);
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn req_offset_format() {
        let msg = InboundMessage {
            topic: "requests".into(),
            partition: 3,
            offset: 42,
            key: None,
            value: vec![],
            timestamp: None,
        };
        assert_eq!(msg.req_offset(), "requests:3:42");
    }

    #[test]
    fn client_config_plaintext() {
        let conf = KafkaCommonConf {
            brokers: vec!["k1:9092".into(), "k2:9092".into()],
            client_id: "bridge".into(),
            ..Default::default()
        };
        let config = client_config(&conf);
        assert_eq!(config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(config.get("security.protocol"), Some("plaintext"));
    }

    #[test]
    fn client_config_sasl_ssl() {
        let mut conf = KafkaCommonConf {
            brokers: vec!["k1:9092".into()],
            ..Default::default()
        };
        conf.tls.enabled = true;
        conf.tls.ca_cert = Some("/certs/ca.pem".into());
        conf.sasl.username = Some("user".into());
        conf.sasl.password = Some("pass".into());
        let config = client_config(&conf);
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("ssl.ca.location"), Some("/certs/ca.pem"));
        assert_eq!(config.get("sasl.mechanisms"), Some("PLAIN"));
    }
}
