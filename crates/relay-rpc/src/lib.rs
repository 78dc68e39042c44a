//! Outbound tool-invocation path: a reconnecting WebSocket client that
//! correlates request frames with asynchronous responses.

mod client;
pub mod wire;

pub use client::{ConnectionState, RpcConfig, ToolClient, ToolInvoker};
