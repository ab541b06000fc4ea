//! Gateway: webhook intake, live-agent REST + WebSocket, health probe.
//!
//! Single port serves HTTP and WebSocket. Webhook deliveries are acknowledged as soon as
//! their signature checks out and are routed afterwards in their own task.

mod protocol;
mod server;
pub mod signature;

pub use protocol::{
    ConnectParams, ConversationParams, HelloOk, JoinParams, SendParams, TypingParams, WsRequest,
    WsResponse,
};
pub use server::{run_gateway, BroadcastTransport};
