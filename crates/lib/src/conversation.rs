//! Conversation record and its state transitions.
//!
//! A record is keyed by (agent_id, conversation_id) and holds the message log, the
//! dedup set of delivery-layer message ids, activity timestamps and the routing state.
//! Transitions are plain methods on the record; the store applies them atomically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::ConversationError;

/// Identifies a conversation: one end user talking to one business agent.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    pub agent_id: String,
    pub conversation_id: String,
}

impl ConversationKey {
    pub fn new(agent_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.conversation_id)
    }
}

/// Who produced a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sender {
    User,
    Bot,
    Agent,
}

/// The part of a message that survives into history: id and text only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One entry of the append-only message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Generated record id (not the delivery-layer message id).
    pub id: String,
    pub timestamp: i64,
    pub message_info: MessageInfo,
    pub sender: Sender,
    pub sent: bool,
}

/// Routing state persisted as a single discriminant plus payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingState {
    #[default]
    SpeakingWithBot,
    RequestedLiveAgent,
    #[serde(rename_all = "camelCase")]
    SpeakingWithAgent { representative_name: String },
}

/// Status as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    SpeakingWithBot,
    RequestedLiveAgent,
    SpeakingWithAgent,
}

impl RoutingState {
    pub fn status(&self) -> ConversationStatus {
        match self {
            RoutingState::SpeakingWithBot => ConversationStatus::SpeakingWithBot,
            RoutingState::RequestedLiveAgent => ConversationStatus::RequestedLiveAgent,
            RoutingState::SpeakingWithAgent { .. } => ConversationStatus::SpeakingWithAgent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub agent_id: String,
    pub conversation_id: String,
    pub display_name: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub message_ids: BTreeSet<String>,
    pub last_timestamp: i64,
    #[serde(default)]
    pub csat_sent: bool,
    #[serde(default)]
    pub state: RoutingState,
    #[serde(default)]
    pub user_is_typing: bool,
}

impl ConversationRecord {
    /// Fresh record for first contact: bot-default state, nothing seen yet.
    pub fn new(key: &ConversationKey, display_name: impl Into<String>, now: i64) -> Self {
        Self {
            agent_id: key.agent_id.clone(),
            conversation_id: key.conversation_id.clone(),
            display_name: display_name.into(),
            messages: Vec::new(),
            message_ids: BTreeSet::new(),
            last_timestamp: now,
            csat_sent: false,
            state: RoutingState::SpeakingWithBot,
            user_is_typing: false,
        }
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.agent_id, &self.conversation_id)
    }

    pub fn status(&self) -> ConversationStatus {
        self.state.status()
    }

    pub fn requested_live_agent(&self) -> bool {
        self.state == RoutingState::RequestedLiveAgent
    }

    /// Name of the joined representative, if any.
    pub fn representative(&self) -> Option<&str> {
        match &self.state {
            RoutingState::SpeakingWithAgent { representative_name } => Some(representative_name),
            _ => None,
        }
    }

    /// Any inbound activity: clears typing, resets the idle clock and re-arms the survey.
    pub fn touch(&mut self, now: i64) {
        self.user_is_typing = false;
        self.last_timestamp = now;
        self.csat_sent = false;
    }

    /// Record a delivery-layer message id; fails if it was already processed.
    pub fn accept_message_id(&mut self, message_id: &str) -> Result<(), ConversationError> {
        if !self.message_ids.insert(message_id.to_string()) {
            return Err(ConversationError::DuplicateMessage(message_id.to_string()));
        }
        Ok(())
    }

    /// Append to the message log; returns the generated record id.
    pub fn push_message(
        &mut self,
        sender: Sender,
        message_info: MessageInfo,
        sent: bool,
        now: i64,
    ) -> String {
        let id = format!("msg-{}", uuid::Uuid::new_v4());
        self.messages.push(StoredMessage {
            id: id.clone(),
            timestamp: now,
            message_info,
            sender,
            sent,
        });
        id
    }

    pub fn request_live_agent(&mut self) -> Result<(), ConversationError> {
        match self.state {
            RoutingState::SpeakingWithBot => {
                self.state = RoutingState::RequestedLiveAgent;
                Ok(())
            }
            RoutingState::RequestedLiveAgent => Err(ConversationError::AlreadyRequested),
            RoutingState::SpeakingWithAgent { .. } => {
                Err(ConversationError::RepresentativeAlreadyPresent)
            }
        }
    }

    /// A human joins. Supersedes any pending live-agent request.
    pub fn join(&mut self, representative_name: &str) -> Result<(), ConversationError> {
        if self.representative().is_some() {
            return Err(ConversationError::RepresentativeAlreadyPresent);
        }
        self.state = RoutingState::SpeakingWithAgent {
            representative_name: representative_name.to_string(),
        };
        Ok(())
    }

    /// The human leaves; returns the name of the representative who left.
    pub fn leave(&mut self) -> Result<String, ConversationError> {
        let name = match &self.state {
            RoutingState::SpeakingWithAgent { representative_name }
                if !representative_name.is_empty() =>
            {
                representative_name.clone()
            }
            _ => return Err(ConversationError::NoRepresentativePresent),
        };
        self.state = RoutingState::SpeakingWithBot;
        Ok(name)
    }

    pub fn set_typing(&mut self, is_typing: bool) {
        self.user_is_typing = is_typing;
    }
}
