//! Outbound message delivery to end users.
//!
//! [`MessageSender`] is the seam the bot path, the live-agent desk and the survey sweep
//! push through; [`BusinessMessagesClient`] is the HTTP implementation.

mod client;
mod types;

pub use client::BusinessMessagesClient;
pub use types::{ConversationEvent, EventType, OutboundMessage, Representative, RepresentativeType};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("delivery api error: {0}")]
    Api(String),
    #[error("delivery not configured: {0}")]
    NotConfigured(String),
}

/// Pushes messages, events and surveys to a user's conversation.
///
/// Each call carries a fresh id so the transport can treat retries idempotently.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError>;

    async fn send_event(
        &self,
        conversation_id: &str,
        event: &ConversationEvent,
    ) -> Result<(), DeliveryError>;

    async fn create_survey(&self, conversation_id: &str) -> Result<(), DeliveryError>;
}
