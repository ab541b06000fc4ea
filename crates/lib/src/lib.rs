//! Handoff core library: conversation store, routing between the NLU bot and human
//! live agents, the inactivity survey, and the webhook/live-agent gateway.

pub mod bot;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod inbound;
pub mod init;
pub mod live_agent;
pub mod messaging;
pub mod nlu;
pub mod routing;
pub mod store;
pub mod survey;

pub use error::ConversationError;
