//! Error types for the bridge

use thiserror::Error;

use crate::eth::rpc::RpcError;

/// Top-level error type for bridge startup and fatal runtime failures.
///
/// Message-level failures (bad payloads, RPC rejections, receipt timeouts)
/// never surface here; they are turned into outbound error replies so the
/// partition offset can still advance.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or invalid configuration, rejected before startup
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Broker or JSON-RPC endpoint unreachable at startup
    #[error("connection failed: {0}")]
    Connect(String),

    /// Kafka client error
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON-RPC transport or server error
    #[error("JSON-RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Envelope serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tracker or producer invariant was violated. Not recoverable:
    /// the bridge collapses and relies on the deployment supervisor to
    /// restart it from the last marked offset.
    #[error("fatal invariant violation: {0}")]
    FatalInvariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, BridgeError>;
