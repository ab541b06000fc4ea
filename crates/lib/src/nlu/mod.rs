//! NLU backend abstraction and the Dialogflow client.
//!
//! A backend turns user text into an ordered list of fulfillments; [`to_outbound`]
//! normalizes each one into an [`OutboundMessage`] spoken by the bot.

mod dialogflow;

pub use dialogflow::DialogflowClient;

use async_trait::async_trait;

use crate::credentials::AgentCredentials;
use crate::messaging::{OutboundMessage, Representative};

#[derive(Debug, thiserror::Error)]
pub enum NluError {
    #[error("nlu request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("nlu api error: {0}")]
    Api(String),
    #[error("nlu credentials invalid: {0}")]
    Credentials(String),
}

/// One fulfillment result, in the order the backend produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Fulfillment {
    /// Custom structured payload (text, richCard, suggestions, fallback).
    Payload(serde_json::Value),
    Text(String),
}

#[async_trait]
pub trait NluBackend: Send + Sync {
    async fn detect_intent(
        &self,
        credentials: &AgentCredentials,
        session_id: &str,
        text: &str,
    ) -> Result<Vec<Fulfillment>, NluError>;
}

/// Normalize a fulfillment into an outbound bot message with a fresh message id.
/// Returns None for payloads that carry nothing deliverable.
pub fn to_outbound(fulfillment: Fulfillment) -> Option<OutboundMessage> {
    match fulfillment {
        Fulfillment::Text(text) => {
            if text.trim().is_empty() {
                None
            } else {
                Some(OutboundMessage::text(Representative::bot(), text))
            }
        }
        Fulfillment::Payload(payload) => {
            let text = payload
                .get("text")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let rich_card = payload.get("richCard").cloned().filter(|v| !v.is_null());
            if text.is_none() && rich_card.is_none() {
                return None;
            }
            let suggestions = payload
                .get("suggestions")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let fallback = payload
                .get("fallback")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(OutboundMessage {
                message_id: uuid::Uuid::new_v4().to_string(),
                representative: Representative::bot(),
                text,
                rich_card,
                suggestions,
                fallback,
            })
        }
    }
}
