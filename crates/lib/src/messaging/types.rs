//! Wire shapes for outbound messages and conversation events.

use serde::{Deserialize, Serialize};

use crate::conversation::MessageInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepresentativeType {
    Bot,
    Human,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Representative {
    pub representative_type: RepresentativeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Representative {
    pub fn bot() -> Self {
        Self {
            representative_type: RepresentativeType::Bot,
            display_name: None,
        }
    }

    pub fn human(display_name: impl Into<String>) -> Self {
        Self {
            representative_type: RepresentativeType::Human,
            display_name: Some(display_name.into()),
        }
    }
}

/// A message to a user: plain text, a rich card, or either with suggestions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub message_id: String,
    pub representative: Representative,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rich_card: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl OutboundMessage {
    /// Text message with a freshly generated message id.
    pub fn text(representative: Representative, text: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            representative,
            text: Some(text.into()),
            rich_card: None,
            suggestions: Vec::new(),
            fallback: None,
        }
    }

    /// What goes into history: rich content and representative metadata are dropped.
    pub fn history_info(&self) -> MessageInfo {
        MessageInfo {
            message_id: Some(self.message_id.clone()),
            text: self.text.clone().or_else(|| self.fallback.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TypingStarted,
    TypingStopped,
    RepresentativeJoined,
    RepresentativeLeft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub event_type: EventType,
    pub representative: Representative,
}

impl ConversationEvent {
    pub fn new(event_type: EventType, representative: Representative) -> Self {
        Self {
            event_type,
            representative,
        }
    }

    pub fn typing(is_typing: bool, representative: Representative) -> Self {
        let event_type = if is_typing {
            EventType::TypingStarted
        } else {
            EventType::TypingStopped
        };
        Self::new(event_type, representative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_info_strips_rich_content() {
        let mut msg = OutboundMessage::text(Representative::bot(), "hello");
        msg.rich_card = Some(serde_json::json!({"standaloneCard": {}}));
        msg.suggestions = vec![serde_json::json!({"reply": {"text": "yes"}})];
        let info = msg.history_info();
        assert_eq!(info.text.as_deref(), Some("hello"));
        assert_eq!(info.message_id.as_deref(), Some(msg.message_id.as_str()));
    }

    #[test]
    fn card_without_text_keeps_fallback_in_history() {
        let msg = OutboundMessage {
            message_id: "m".to_string(),
            representative: Representative::bot(),
            text: None,
            rich_card: Some(serde_json::json!({})),
            suggestions: Vec::new(),
            fallback: Some("card".to_string()),
        };
        assert_eq!(msg.history_info().text.as_deref(), Some("card"));
    }

    #[test]
    fn event_wire_shape() {
        let ev = ConversationEvent::new(EventType::RepresentativeJoined, Representative::human("Echo"));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["eventType"], "REPRESENTATIVE_JOINED");
        assert_eq!(v["representative"]["representativeType"], "HUMAN");
        assert_eq!(v["representative"]["displayName"], "Echo");
    }
}
