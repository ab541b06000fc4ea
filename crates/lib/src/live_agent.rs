//! Agent path and live-agent control actions.
//!
//! While a human is joined, user content is persisted and forwarded to the live-agent
//! transport instead of the NLU. Join, leave, typing and send come from the live-agent
//! frontend and drive the conversation's routing state.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::conversation::{ConversationKey, MessageInfo, Sender};
use crate::error::ConversationError;
use crate::messaging::{ConversationEvent, EventType, MessageSender, OutboundMessage, Representative};
use crate::store::ConversationStore;

/// What the live-agent frontend is told about a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DeskEvent {
    #[serde(rename_all = "camelCase")]
    UserMessage {
        #[serde(flatten)]
        key: ConversationKey,
        display_name: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    UserTyping {
        #[serde(flatten)]
        key: ConversationKey,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    LiveAgentRequested {
        #[serde(flatten)]
        key: ConversationKey,
        display_name: String,
    },
}

/// Delivery to human agents. Fire-and-forget: a frontend that is not listening misses the event.
#[async_trait]
pub trait LiveAgentTransport: Send + Sync {
    async fn forward(&self, event: DeskEvent);
}

pub struct LiveAgentDesk {
    store: Arc<ConversationStore>,
    sender: Arc<dyn MessageSender>,
    transport: Arc<dyn LiveAgentTransport>,
}

fn require(value: &str, name: &str) -> Result<(), ConversationError> {
    if value.trim().is_empty() {
        return Err(ConversationError::MissingArguments(name.to_string()));
    }
    Ok(())
}

fn require_key(key: &ConversationKey) -> Result<(), ConversationError> {
    require(&key.agent_id, "agentId")?;
    require(&key.conversation_id, "conversationId")
}

impl LiveAgentDesk {
    pub fn new(
        store: Arc<ConversationStore>,
        sender: Arc<dyn MessageSender>,
        transport: Arc<dyn LiveAgentTransport>,
    ) -> Self {
        Self {
            store,
            sender,
            transport,
        }
    }

    /// User text while routed to a human: dedup, persist, forward.
    pub async fn handle_text(
        &self,
        key: &ConversationKey,
        message_id: &str,
        text: &str,
        now: i64,
    ) -> Result<(), ConversationError> {
        let display_name = self
            .store
            .update(key, |r| {
                r.accept_message_id(message_id)?;
                r.push_message(
                    Sender::User,
                    MessageInfo {
                        message_id: Some(message_id.to_string()),
                        text: Some(text.to_string()),
                    },
                    true,
                    now,
                );
                Ok(r.display_name.clone())
            })
            .await?;
        self.transport
            .forward(DeskEvent::UserMessage {
                key: key.clone(),
                display_name,
                text: text.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn handle_suggestion(
        &self,
        key: &ConversationKey,
        postback_data: &str,
        now: i64,
    ) -> Result<(), ConversationError> {
        let display_name = self
            .store
            .update(key, |r| {
                r.push_message(
                    Sender::User,
                    MessageInfo {
                        message_id: None,
                        text: Some(postback_data.to_string()),
                    },
                    true,
                    now,
                );
                Ok(r.display_name.clone())
            })
            .await?;
        self.transport
            .forward(DeskEvent::UserMessage {
                key: key.clone(),
                display_name,
                text: postback_data.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn handle_typing(
        &self,
        key: &ConversationKey,
        is_typing: bool,
    ) -> Result<(), ConversationError> {
        self.store
            .update(key, |r| {
                r.set_typing(is_typing);
                Ok(())
            })
            .await?;
        self.transport
            .forward(DeskEvent::UserTyping {
                key: key.clone(),
                is_typing,
            })
            .await;
        Ok(())
    }

    pub async fn handle_live_agent_request(
        &self,
        key: &ConversationKey,
    ) -> Result<(), ConversationError> {
        let display_name = self
            .store
            .update(key, |r| {
                r.request_live_agent()?;
                Ok(r.display_name.clone())
            })
            .await?;
        self.transport
            .forward(DeskEvent::LiveAgentRequested {
                key: key.clone(),
                display_name,
            })
            .await;
        Ok(())
    }

    /// A human joins: clears any pending request and announces the representative to the user.
    pub async fn join(&self, key: &ConversationKey, name: &str) -> Result<(), ConversationError> {
        require_key(key)?;
        require(name, "name")?;
        let name = name.trim();
        self.store.update(key, |r| r.join(name)).await?;
        log::info!("desk: {} joined {}", name, key);
        // The join is committed; a lost announcement does not undo it.
        let event = ConversationEvent::new(EventType::RepresentativeJoined, Representative::human(name));
        if let Err(e) = self.sender.send_event(&key.conversation_id, &event).await {
            log::warn!("desk: join event for {} failed: {}", key, e);
        }
        Ok(())
    }

    /// The human leaves: back to the bot, announce it, and survey the user right away.
    /// Delivery failures after the state change are logged, not returned.
    pub async fn leave(&self, key: &ConversationKey) -> Result<(), ConversationError> {
        require_key(key)?;
        let name = self.store.update(key, |r| r.leave()).await?;
        log::info!("desk: {} left {}", name, key);
        let event = ConversationEvent::new(EventType::RepresentativeLeft, Representative::human(&name));
        if let Err(e) = self.sender.send_event(&key.conversation_id, &event).await {
            log::warn!("desk: leave event for {} failed: {}", key, e);
        }
        // A failed survey leaves csat armed so the inactivity sweep retries it.
        if let Err(e) = self.sender.create_survey(&key.conversation_id).await {
            log::warn!("desk: survey after leave for {} failed: {}", key, e);
            return Ok(());
        }
        self.store
            .update(key, |r| {
                r.csat_sent = true;
                Ok(())
            })
            .await
    }

    /// Typing indicator from the human to the user.
    pub async fn typing(
        &self,
        key: &ConversationKey,
        is_typing: bool,
    ) -> Result<(), ConversationError> {
        require_key(key)?;
        let name = self.representative(key).await?;
        let event = ConversationEvent::typing(is_typing, Representative::human(name));
        self.sender.send_event(&key.conversation_id, &event).await?;
        Ok(())
    }

    /// Message from the human to the user, through the same send primitive the bot uses.
    pub async fn send(
        &self,
        key: &ConversationKey,
        text: &str,
        now: i64,
    ) -> Result<OutboundMessage, ConversationError> {
        require_key(key)?;
        require(text, "text")?;
        let name = self.representative(key).await?;
        let message = OutboundMessage::text(Representative::human(name), text);
        let result = self.sender.send_message(&key.conversation_id, &message).await;
        let info = message.history_info();
        let sent = result.is_ok();
        self.store
            .update(key, |r| {
                r.push_message(Sender::Agent, info, sent, now);
                Ok(())
            })
            .await?;
        result?;
        Ok(message)
    }

    async fn representative(&self, key: &ConversationKey) -> Result<String, ConversationError> {
        let record = self
            .store
            .get(key)
            .await
            .ok_or_else(|| ConversationError::ConversationNotFound(key.to_string()))?;
        record
            .representative()
            .map(str::to_string)
            .ok_or(ConversationError::NoRepresentativePresent)
    }
}
