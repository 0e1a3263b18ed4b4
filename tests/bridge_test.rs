//! End-to-end bridge scenarios over a mock log client and a mock JSON-RPC
//! endpoint: ordering, dedup, backpressure, and the error paths

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use ethconnect::config::KafkaBridgeConf;
use ethconnect::error::{BridgeError, Result as BridgeResult};
use ethconnect::eth::rpc::{EthRpc, RpcError};
use ethconnect::eth::MsgProcessor;
use ethconnect::kafka::{
    DeliveryAck, DeliveryFailure, InboundMessage, KafkaBridge, LogConsumer, MessageHandler,
    MsgContext, OutboundRecord, ProducerChannels,
};
use ethconnect::messages::QueryResult;

// ---------------------------------------------------------------------
// mock log client

struct MockConsumer {
    stream: Mutex<mpsc::Receiver<InboundMessage>>,
    marks: StdMutex<Vec<(String, i32, i64)>>,
}

impl MockConsumer {
    fn new() -> (Arc<Self>, mpsc::Sender<InboundMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                stream: Mutex::new(rx),
                marks: StdMutex::new(Vec::new()),
            }),
            tx,
        )
    }

    fn marks(&self) -> Vec<(String, i32, i64)> {
        self.marks.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogConsumer for MockConsumer {
    async fn next(&self) -> Option<InboundMessage> {
        self.stream.lock().await.recv().await
    }

    fn mark_offset(&self, msg: &InboundMessage) -> BridgeResult<()> {
        self.marks
            .lock()
            .unwrap()
            .push((msg.topic.clone(), msg.partition, msg.offset));
        Ok(())
    }
}

/// Test-side view of the producer: records that reached the "broker" plus
/// handles to inject delivery outcomes
struct ProducerHarness {
    sent: mpsc::Receiver<OutboundRecord>,
    ack_tx: mpsc::Sender<DeliveryAck>,
    err_tx: mpsc::Sender<DeliveryFailure>,
}

/// Build producer channels backed by a forwarding task. With `auto_ack`
/// every record is acknowledged in arrival order, mimicking a healthy
/// broker; without it the test drives acks through the harness.
fn mock_producer(auto_ack: bool) -> (ProducerChannels, ProducerHarness) {
    let (input_tx, mut input_rx) = mpsc::channel::<OutboundRecord>(64);
    let (ack_tx, ack_rx) = mpsc::channel::<DeliveryAck>(64);
    let (err_tx, err_rx) = mpsc::channel::<DeliveryFailure>(64);
    let (sent_tx, sent_rx) = mpsc::channel::<OutboundRecord>(64);

    let forward_ack = ack_tx.clone();
    tokio::spawn(async move {
        while let Some(record) = input_rx.recv().await {
            let req_offset = record.req_offset.clone();
            if sent_tx.send(record).await.is_err() {
                break;
            }
            if auto_ack {
                if forward_ack.send(DeliveryAck { req_offset }).await.is_err() {
                    break;
                }
            }
        }
    });

    (
        ProducerChannels {
            input: input_tx,
            successes: ack_rx,
            errors: err_rx,
        },
        ProducerHarness {
            sent: sent_rx,
            ack_tx,
            err_tx,
        },
    )
}

// ---------------------------------------------------------------------
// mock JSON-RPC endpoint

struct MockRpc {
    responses: StdMutex<HashMap<String, VecDeque<Value>>>,
}

impl MockRpc {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(HashMap::new()),
        })
    }

    fn script(&self, method: &str, result: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }
}

#[async_trait]
impl EthRpc for MockRpc {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        if let Some(result) = self
            .responses
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return Ok(result);
        }
        // Unscripted receipt queries stay pending, everything else is a
        // node-side error
        if method == "eth_getTransactionReceipt" {
            return Ok(Value::Null);
        }
        Err(RpcError::Server {
            code: -32601,
            message: format!("unscripted method {method}"),
        })
    }
}

// ---------------------------------------------------------------------
// test handlers and helpers

/// Handler that parks every context until the test decides to reply
struct ManualHandler {
    contexts: StdMutex<HashMap<String, Arc<MsgContext>>>,
    dispatched: AtomicUsize,
}

impl ManualHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            contexts: StdMutex::new(HashMap::new()),
            dispatched: AtomicUsize::new(0),
        })
    }

    fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    async fn reply_to(&self, req_offset: &str) {
        let ctx = self
            .contexts
            .lock()
            .unwrap()
            .get(req_offset)
            .cloned()
            .unwrap_or_else(|| panic!("no parked context for {req_offset}"));
        ctx.reply(QueryResult { result: json!("ok") }).await;
    }
}

#[async_trait]
impl MessageHandler for ManualHandler {
    async fn on_message(&self, ctx: Arc<MsgContext>) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        self.contexts
            .lock()
            .unwrap()
            .insert(ctx.req_offset().to_string(), ctx);
    }
}

fn test_conf(max_in_flight: usize) -> KafkaBridgeConf {
    let mut conf = KafkaBridgeConf::default();
    conf.kafka.brokers = vec!["mock:9092".into()];
    conf.kafka.consumer_group = "test".into();
    conf.kafka.topic_in = "in".into();
    conf.kafka.topic_out = "out".into();
    conf.rpc.url = "http://mock:8545".into();
    conf.max_in_flight = max_in_flight;
    conf.max_tx_wait_time = 10;
    conf
}

fn request(partition: i32, offset: i64, headers: Value, body: Value) -> InboundMessage {
    let mut doc = body;
    doc["headers"] = headers;
    InboundMessage {
        topic: "in".into(),
        partition,
        offset,
        key: None,
        value: serde_json::to_vec(&doc).unwrap(),
        timestamp: None,
    }
}

fn spawn_bridge(
    bridge: Arc<KafkaBridge>,
    consumer: Arc<MockConsumer>,
    producer: ProducerChannels,
    handler: Arc<dyn MessageHandler>,
) -> JoinHandle<BridgeResult<()>> {
    tokio::spawn(async move { bridge.run_with(consumer, producer, handler).await })
}

async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------
// scenarios

#[tokio::test]
async fn single_message_success() {
    let bridge = Arc::new(KafkaBridge::new(test_conf(10)));
    let (consumer, inbound) = MockConsumer::new();
    let (producer, mut harness) = mock_producer(true);

    let rpc = MockRpc::new();
    rpc.script("eth_sendTransaction", json!("0xT"));
    rpc.script(
        "eth_getTransactionReceipt",
        json!({
            "blockNumber": "0x10",
            "blockHash": "0xB",
            "gasUsed": "0x5208",
            "status": "0x1"
        }),
    );
    let handler: Arc<dyn MessageHandler> =
        Arc::new(MsgProcessor::new(rpc.clone(), bridge.conf()));

    let _run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler);

    inbound
        .send(request(
            0,
            5,
            json!({"id": "A", "msgType": "SendTransaction", "account": "0xabc"}),
            json!({"from": "0xabc", "to": "0xdef", "gas": 40000, "data": "a9059cbb"}),
        ))
        .await
        .unwrap();

    let record = harness.sent.recv().await.unwrap();
    assert_eq!(record.key, "0xabc");
    assert_eq!(record.req_offset, "in:0:5");
    let doc: Value = serde_json::from_slice(&record.value).unwrap();
    assert_eq!(doc["headers"]["reqId"], "A");
    assert_eq!(doc["headers"]["reqOffset"], "in:0:5");
    assert_eq!(doc["headers"]["msgType"], "TransactionSuccess");
    assert_eq!(doc["txHash"], "0xT");
    assert_eq!(doc["blockNumber"], "0x10");
    assert!(doc["headers"]["elapsed"].as_f64().unwrap() >= 0.0);

    let tracker = bridge.tracker();
    wait_for("offset mark", || {
        let consumer = consumer.clone();
        async move { !consumer.marks().is_empty() }
    })
    .await;
    assert_eq!(consumer.marks(), vec![("in".to_string(), 0, 5)]);
    assert!(tracker.is_empty().await);
}

#[tokio::test]
async fn out_of_order_completion_single_partition() {
    let bridge = Arc::new(KafkaBridge::new(test_conf(10)));
    let (consumer, inbound) = MockConsumer::new();
    let (producer, _harness) = mock_producer(true);
    let handler = ManualHandler::new();

    let _run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler.clone());

    for offset in [10, 11, 12] {
        inbound
            .send(request(
                0,
                offset,
                json!({"id": format!("id-{offset}"), "msgType": "Query"}),
                json!({"to": "0x1"}),
            ))
            .await
            .unwrap();
    }
    let tracker = bridge.tracker();
    wait_for("all three dispatched", || {
        let handler = handler.clone();
        async move { handler.dispatched() == 3 }
    })
    .await;

    // Completing the middle and the tail leaves the head gap in place
    handler.reply_to("in:0:11").await;
    handler.reply_to("in:0:12").await;
    wait_for("11 and 12 confirmed", || {
        let tracker = tracker.clone();
        async move {
            tracker.describe("in:0:11").await.map_or(false, |d| d.contains("complete=true"))
                && tracker.describe("in:0:12").await.map_or(false, |d| d.contains("complete=true"))
        }
    })
    .await;
    assert!(consumer.marks().is_empty());
    assert_eq!(tracker.len().await, 3);

    // Filling the gap releases the whole run with a single mark
    handler.reply_to("in:0:10").await;
    wait_for("offset mark", || {
        let consumer = consumer.clone();
        async move { !consumer.marks().is_empty() }
    })
    .await;
    assert_eq!(consumer.marks(), vec![("in".to_string(), 0, 12)]);
    assert!(tracker.is_empty().await);
}

#[tokio::test]
async fn redelivery_of_inflight_coordinate_is_ignored() {
    let bridge = Arc::new(KafkaBridge::new(test_conf(10)));
    let (consumer, inbound) = MockConsumer::new();
    let (producer, mut harness) = mock_producer(true);
    let handler = ManualHandler::new();

    let _run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler.clone());

    let msg = request(
        0,
        7,
        json!({"id": "R", "msgType": "Query"}),
        json!({"to": "0x1"}),
    );
    inbound.send(msg.clone()).await.unwrap();
    inbound.send(msg).await.unwrap();

    let tracker = bridge.tracker();
    wait_for("first dispatch", || {
        let handler = handler.clone();
        async move { handler.dispatched() >= 1 }
    })
    .await;
    // Give the redelivery time to be (wrongly) dispatched before checking
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.dispatched(), 1);
    assert_eq!(tracker.len().await, 1);

    handler.reply_to("in:0:7").await;
    wait_for("offset mark", || {
        let consumer = consumer.clone();
        async move { !consumer.marks().is_empty() }
    })
    .await;
    assert_eq!(consumer.marks(), vec![("in".to_string(), 0, 7)]);

    // Exactly one reply crossed the producer
    let first = harness.sent.recv().await;
    assert!(first.is_some());
    assert!(harness.sent.try_recv().is_err());
}

#[tokio::test]
async fn unparseable_payload_gets_error_reply_and_advances() {
    let bridge = Arc::new(KafkaBridge::new(test_conf(10)));
    let (consumer, inbound) = MockConsumer::new();
    let (producer, mut harness) = mock_producer(true);
    let handler = ManualHandler::new();

    let _run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler.clone());

    inbound
        .send(InboundMessage {
            topic: "in".into(),
            partition: 0,
            offset: 3,
            key: None,
            value: b"not json".to_vec(),
            timestamp: None,
        })
        .await
        .unwrap();

    let record = harness.sent.recv().await.unwrap();
    let doc: Value = serde_json::from_slice(&record.value).unwrap();
    assert_eq!(doc["headers"]["msgType"], "Error");
    assert_eq!(doc["headers"]["reqOffset"], "in:0:3");
    assert_eq!(doc["status"], 400);
    assert_eq!(doc["originalMessage"], "not json");
    // A minted UUID stands in for both the request ID and the key
    assert_eq!(record.key.len(), 36);
    assert_eq!(doc["headers"]["reqId"].as_str().unwrap(), record.key);

    // The payload never reached the processor
    assert_eq!(handler.dispatched(), 0);

    wait_for("offset mark", || {
        let consumer = consumer.clone();
        async move { !consumer.marks().is_empty() }
    })
    .await;
    assert_eq!(consumer.marks(), vec![("in".to_string(), 0, 3)]);
    assert!(bridge.tracker().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn receipt_timeout_replies_504_with_tx_hash() {
    let bridge = Arc::new(KafkaBridge::new(test_conf(10)));
    let (consumer, inbound) = MockConsumer::new();
    let (producer, mut harness) = mock_producer(true);

    let rpc = MockRpc::new();
    rpc.script("eth_sendTransaction", json!("0xT"));
    // No receipt scripted: every poll sees null until the wait expires
    let handler: Arc<dyn MessageHandler> =
        Arc::new(MsgProcessor::new(rpc.clone(), bridge.conf()));

    let _run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler);

    inbound
        .send(request(
            0,
            1,
            json!({"id": "T", "msgType": "SendTransaction"}),
            json!({"from": "0xabc", "to": "0xdef"}),
        ))
        .await
        .unwrap();

    let record = harness.sent.recv().await.unwrap();
    let doc: Value = serde_json::from_slice(&record.value).unwrap();
    assert_eq!(doc["headers"]["msgType"], "Error");
    assert_eq!(doc["status"], 504);
    assert_eq!(doc["txHash"], "0xT");

    wait_for("offset mark", || {
        let consumer = consumer.clone();
        async move { !consumer.marks().is_empty() }
    })
    .await;
    assert_eq!(consumer.marks(), vec![("in".to_string(), 0, 1)]);
}

#[tokio::test]
async fn predicted_nonce_is_fetched_when_absent() {
    let bridge = {
        let mut conf = test_conf(10);
        conf.always_manage_nonce = true;
        Arc::new(KafkaBridge::new(conf))
    };
    let (consumer, inbound) = MockConsumer::new();
    let (producer, mut harness) = mock_producer(true);

    let rpc = MockRpc::new();
    rpc.script("eth_getTransactionCount", json!("0x2a"));
    rpc.script("eth_sendTransaction", json!("0xN"));
    rpc.script("eth_getTransactionReceipt", json!({"status": "0x1"}));
    let handler: Arc<dyn MessageHandler> =
        Arc::new(MsgProcessor::new(rpc.clone(), bridge.conf()));

    let _run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler);

    inbound
        .send(request(
            0,
            1,
            json!({"id": "N", "msgType": "SendTransaction"}),
            json!({"from": "0xabc", "to": "0xdef"}),
        ))
        .await
        .unwrap();

    let record = harness.sent.recv().await.unwrap();
    let doc: Value = serde_json::from_slice(&record.value).unwrap();
    assert_eq!(doc["headers"]["msgType"], "TransactionSuccess");
    assert_eq!(doc["txHash"], "0xN");
    // The transaction count queue drained: the nonce really was fetched
    assert!(rpc.responses.lock().unwrap()["eth_getTransactionCount"].is_empty());
}

#[tokio::test]
async fn capacity_ceiling_is_never_exceeded() {
    let bridge = Arc::new(KafkaBridge::new(test_conf(2)));
    let (consumer, inbound) = MockConsumer::new();
    let (producer, _harness) = mock_producer(true);

    // Replies are delayed and deliberately staggered so later offsets can
    // finish first within each admission window
    struct DelayedHandler {
        tracker: Arc<ethconnect::kafka::InFlightTracker>,
        dispatched: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for DelayedHandler {
        async fn on_message(&self, ctx: Arc<MsgContext>) {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            let depth = self.tracker.len().await;
            self.max_seen.fetch_max(depth, Ordering::SeqCst);
            let delay = Duration::from_millis(20 + (ctx.offset() as u64 % 2) * 40);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                ctx.reply(QueryResult { result: json!("ok") }).await;
            });
        }
    }

    let handler = Arc::new(DelayedHandler {
        tracker: bridge.tracker(),
        dispatched: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    });
    let _run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler.clone());

    for offset in 0..5 {
        inbound
            .send(request(
                0,
                offset,
                json!({"id": format!("c-{offset}"), "msgType": "Query"}),
                json!({"to": "0x1"}),
            ))
            .await
            .unwrap();
    }

    let consumer_for_wait = consumer.clone();
    wait_for("all five processed", move || {
        let consumer = consumer_for_wait.clone();
        async move { consumer.marks().last().map(|m| m.2) == Some(4) }
    })
    .await;

    assert_eq!(handler.dispatched.load(Ordering::SeqCst), 5);
    assert!(handler.max_seen.load(Ordering::SeqCst) <= 2);
    // Marked offsets only ever move forward
    let marks = consumer.marks();
    assert!(marks.windows(2).all(|w| w[0].2 <= w[1].2));
    assert!(bridge.tracker().is_empty().await);
}

#[tokio::test]
async fn producer_failure_collapses_the_bridge() {
    let bridge = Arc::new(KafkaBridge::new(test_conf(10)));
    let (consumer, inbound) = MockConsumer::new();
    let (producer, mut harness) = mock_producer(false);
    let handler = ManualHandler::new();

    let run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler.clone());

    inbound
        .send(request(
            0,
            2,
            json!({"id": "F", "msgType": "Query"}),
            json!({"to": "0x1"}),
        ))
        .await
        .unwrap();
    wait_for("dispatch", || {
        let handler = handler.clone();
        async move { handler.dispatched() == 1 }
    })
    .await;
    handler.reply_to("in:0:2").await;

    let record = harness.sent.recv().await.unwrap();
    harness
        .err_tx
        .send(DeliveryFailure {
            req_offset: record.req_offset,
            cause: "broker gone".into(),
        })
        .await
        .unwrap();

    let result = run.await.unwrap();
    assert!(matches!(result, Err(BridgeError::FatalInvariant(_))));
    // Nothing was marked: the request will be redelivered on restart
    assert!(consumer.marks().is_empty());
}

#[tokio::test]
async fn ack_for_unknown_coordinate_is_fatal() {
    let bridge = Arc::new(KafkaBridge::new(test_conf(10)));
    let (consumer, _inbound) = MockConsumer::new();
    let (producer, harness) = mock_producer(false);
    let handler = ManualHandler::new();

    let run = spawn_bridge(bridge.clone(), consumer.clone(), producer, handler);

    harness
        .ack_tx
        .send(DeliveryAck {
            req_offset: "in:0:99".into(),
        })
        .await
        .unwrap();

    let result = run.await.unwrap();
    assert!(matches!(result, Err(BridgeError::FatalInvariant(_))));
}
