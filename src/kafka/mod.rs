//! Kafka side of the bridge: log client abstraction, per-message context,
//! in-flight tracking, and the bridge loops

pub mod bridge;
pub mod client;
pub mod context;
pub mod inflight;

pub use bridge::{KafkaBridge, MessageHandler};
pub use client::{
    DeliveryAck, DeliveryFailure, InboundMessage, LogConsumer, OutboundRecord, ProducerChannels,
    ReplySink,
};
pub use context::MsgContext;
pub use inflight::{Admission, InFlightTracker};
