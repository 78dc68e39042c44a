//! Inbound event path: client directory, subscription registry, run lifecycle
//! tracking, and the gateway façade that fans events out to subscribers, plus
//! the WebSocket server exposing the control-frame protocol.

pub mod client;
pub mod frames;
pub mod gateway;
pub mod runs;
pub mod server;
pub mod subscription;

pub use gateway::{start_sweep_task, Gateway, GatewayConfig};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
