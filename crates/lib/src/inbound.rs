//! Inbound webhook payloads and the events the dispatcher routes.

use serde::Deserialize;

use crate::conversation::ConversationKey;
use crate::error::ConversationError;

/// A verified inbound event for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub key: ConversationKey,
    /// User's display name; only used when the conversation is created.
    pub display_name: String,
    pub kind: InboundKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Text { message_id: String, text: String },
    /// Postback data stands in for the message text.
    Suggestion { postback_data: String },
    RequestedLiveAgent,
    Typing { is_typing: bool },
}

/// Raw webhook body. Everything is optional; [`WebhookPayload::into_event`] validates.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: Option<WebhookMessage>,
    #[serde(default)]
    pub suggestion_response: Option<SuggestionResponse>,
    #[serde(default)]
    pub user_status: Option<UserStatus>,
    #[serde(default)]
    pub context: Option<WebhookContext>,
    /// Present only on the one-time webhook verification request.
    #[serde(default)]
    pub client_token: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionResponse {
    #[serde(default)]
    pub postback_data: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    #[serde(default)]
    pub requested_live_agent: Option<bool>,
    #[serde(default)]
    pub is_typing: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookContext {
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Agent id from either a bare id or a resource name like `brands/B/agents/A`.
pub fn agent_id_from_name(agent: &str) -> &str {
    agent.trim().rsplit('/').next().unwrap_or_default()
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

impl WebhookPayload {
    pub fn is_verification(&self) -> bool {
        self.client_token.is_some() && self.secret.is_some()
    }

    /// Validate into an event. `Ok(None)` for payloads this router does not handle
    /// (receipts, status updates with no known field, etc.).
    pub fn into_event(self) -> Result<Option<InboundEvent>, ConversationError> {
        let agent_id = non_empty(self.agent.as_deref())
            .map(agent_id_from_name)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ConversationError::MissingArguments("agent".to_string()))?
            .to_string();
        let conversation_id = non_empty(self.conversation_id.as_deref())
            .ok_or_else(|| ConversationError::MissingArguments("conversationId".to_string()))?
            .to_string();
        let display_name = self
            .context
            .as_ref()
            .and_then(|c| c.user_info.as_ref())
            .and_then(|u| non_empty(u.display_name.as_deref()))
            .unwrap_or_default()
            .to_string();

        let kind = if let Some(message) = self.message {
            let message_id = non_empty(message.message_id.as_deref())
                .ok_or_else(|| ConversationError::MissingArguments("message.messageId".to_string()))?
                .to_string();
            let Some(text) = message.text else {
                return Ok(None);
            };
            InboundKind::Text { message_id, text }
        } else if let Some(suggestion) = self.suggestion_response {
            let postback_data = suggestion
                .postback_data
                .or(suggestion.text)
                .ok_or_else(|| {
                    ConversationError::MissingArguments("suggestionResponse.postbackData".to_string())
                })?;
            InboundKind::Suggestion { postback_data }
        } else if let Some(status) = self.user_status {
            if status.requested_live_agent == Some(true) {
                InboundKind::RequestedLiveAgent
            } else if let Some(is_typing) = status.is_typing {
                InboundKind::Typing { is_typing }
            } else {
                return Ok(None);
            }
        } else {
            return Ok(None);
        };

        Ok(Some(InboundEvent {
            key: ConversationKey::new(agent_id, conversation_id),
            display_name,
            kind,
        }))
    }
}
