//! The Kafka->Ethereum bridge: consumer dispatch loop, producer feedback
//! loops, and the wiring between them

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::KafkaBridgeConf;
use crate::error::{BridgeError, Result};
use crate::eth::processor::MsgProcessor;
use crate::eth::rpc::HttpRpc;
use crate::kafka::client::{spawn_producer, KafkaLogConsumer, LogConsumer, ProducerChannels};
use crate::kafka::context::MsgContext;
use crate::kafka::inflight::{Admission, InFlightTracker};

/// Interval between in-flight depth reports
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Receives each admitted context and owns the obligation to call exactly
/// one reply on it, including on every error path. Must not block the
/// dispatch loop; long-running work belongs on its own task.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, ctx: Arc<MsgContext>);
}

/// One Kafka->Ethereum bridge instance
pub struct KafkaBridge {
    conf: KafkaBridgeConf,
    tracker: Arc<InFlightTracker>,
}

impl KafkaBridge {
    /// Build a bridge from a validated configuration
    pub fn new(conf: KafkaBridgeConf) -> Self {
        let tracker = Arc::new(InFlightTracker::new(conf.max_in_flight));
        Self { conf, tracker }
    }

    pub fn conf(&self) -> &KafkaBridgeConf {
        &self.conf
    }

    /// The in-flight tracker, exposed for diagnostics and tests
    pub fn tracker(&self) -> Arc<InFlightTracker> {
        self.tracker.clone()
    }

    /// Connect to the JSON-RPC node and the broker, then serve until the
    /// consumer stream closes, a fatal error occurs, or ctrl-c arrives.
    pub async fn run(&self) -> Result<()> {
        let rpc = Arc::new(HttpRpc::connect(&self.conf.rpc.url)?);
        info!(url = %self.conf.rpc.url, "JSON-RPC client ready");
        let processor: Arc<dyn MessageHandler> = Arc::new(MsgProcessor::new(rpc, &self.conf));
        let consumer: Arc<dyn LogConsumer> = Arc::new(KafkaLogConsumer::new(&self.conf.kafka)?);
        let producer = spawn_producer(&self.conf.kafka)?;

        tokio::select! {
            result = self.run_with(consumer, producer, processor) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                Ok(())
            }
        }
    }

    /// Drive the bridge loops over any log client and handler. The first
    /// loop to finish resolves the whole bridge; in-flight contexts are
    /// abandoned and redelivered from the last marked offset next run.
    pub async fn run_with(
        &self,
        consumer: Arc<dyn LogConsumer>,
        producer: ProducerChannels,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let ProducerChannels {
            input,
            mut successes,
            mut errors,
        } = producer;
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        // Consumer dispatch loop: admit under the capacity gate, then hand
        // off without holding anything.
        {
            let tracker = self.tracker.clone();
            let consumer = consumer.clone();
            let handler = handler.clone();
            tasks.spawn(async move {
                debug!("consumer dispatch loop started");
                while let Some(msg) = consumer.next().await {
                    debug!(
                        partition = msg.partition,
                        offset = msg.offset,
                        "consumer received message"
                    );
                    let permit = tracker.acquire().await?;
                    match tracker.admit(permit, msg, input.clone()).await {
                        Admission::Duplicate => {}
                        Admission::BadPayload(ctx) => {
                            ctx.send_error_reply(400, "unable to decode message payload")
                                .await;
                        }
                        Admission::Admitted(ctx) => handler.on_message(ctx).await,
                    }
                }
                debug!("consumer stream closed");
                Ok(())
            });
        }

        // Producer success loop: confirmed replies advance offsets.
        {
            let tracker = self.tracker.clone();
            let consumer = consumer.clone();
            tasks.spawn(async move {
                debug!("producer success loop started");
                while let Some(ack) = successes.recv().await {
                    tracker.complete(&ack.req_offset, consumer.as_ref()).await?;
                }
                debug!("producer success stream closed");
                Ok(())
            });
        }

        // Producer error loop: a failed reply means an on-chain action may
        // have happened without a visible reply. Retrying here risks a
        // double send, so the bridge collapses and the process supervisor
        // restarts it; the unmarked offset redelivers the request.
        {
            let tracker = self.tracker.clone();
            tasks.spawn(async move {
                debug!("producer error loop started");
                while let Some(failure) = errors.recv().await {
                    let context = tracker
                        .describe(&failure.req_offset)
                        .await
                        .unwrap_or_else(|| failure.req_offset.clone());
                    error!(context = %context, cause = %failure.cause, "Kafka producer failed for reply");
                    return Err(BridgeError::FatalInvariant(format!(
                        "reply delivery failed for {}: {}",
                        failure.req_offset, failure.cause
                    )));
                }
                debug!("producer error stream closed");
                Ok(())
            });
        }

        // Periodic depth report
        {
            let tracker = self.tracker.clone();
            let max_in_flight = self.conf.max_in_flight;
            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(STATS_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let in_flight = tracker.len().await;
                    debug!(in_flight, max_in_flight, "bridge in-flight depth");
                }
            });
        }

        let result = match tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(join_err)) => Err(BridgeError::FatalInvariant(format!(
                "bridge task panicked: {join_err}"
            ))),
            None => Ok(()),
        };
        tasks.shutdown().await;
        result
    }
}
