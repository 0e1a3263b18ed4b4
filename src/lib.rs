//! Connectivity bridge between Kafka and Ethereum JSON-RPC nodes
//!
//! The bridge consumes request messages from an inbound topic, dispatches
//! them as transactions or calls against a JSON-RPC endpoint, and publishes
//! success or error replies to an outbound topic. Per-partition commit
//! ordering is preserved even though requests complete out of order: the
//! in-flight tracker only marks offsets up to the contiguous run of
//! confirmed replies at the head of each partition, bounded by a
//! configurable in-flight ceiling.
//!
//! A webhook sidecar can run alongside, translating HTTP POSTs into
//! inbound-topic messages for clients that prefer request-reply semantics.
//!
//! # Example
//!
//! ```no_run
//! use ethconnect::config::KafkaBridgeConf;
//! use ethconnect::kafka::KafkaBridge;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut conf: KafkaBridgeConf = serde_yaml::from_str(
//!     r#"
//! kafka:
//!   brokers: ["localhost:9092"]
//!   consumerGroup: ethconnect
//!   topicIn: requests
//!   topicOut: replies
//! rpc:
//!   url: http://localhost:8545
//! "#,
//! )?;
//! conf.validate()?;
//! KafkaBridge::new(conf).run().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod eth;
pub mod kafka;
pub mod messages;
pub mod server;
pub mod webhooks;

pub use error::{BridgeError, Result};
pub use kafka::KafkaBridge;
pub use webhooks::WebhooksBridge;
