//! Ethereum side of the bridge: JSON-RPC transport and the message
//! processor

pub mod processor;
pub mod rpc;

pub use processor::MsgProcessor;
pub use rpc::{EthRpc, HttpRpc, RpcError};
