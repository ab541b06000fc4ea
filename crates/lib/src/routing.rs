//! Inbound routing: resolve a conversation's status and hand the event to the bot or to a human.
//!
//! Every inbound event refreshes the conversation's activity (typing off, idle clock reset,
//! survey re-armed). Status BOT and REQUESTED_LIVE go to the bot path, WITH_AGENT goes to
//! the live-agent desk. Agents without NLU credentials always go to the desk.

use std::sync::Arc;

use crate::bot::BotPath;
use crate::conversation::{ConversationKey, ConversationStatus};
use crate::credentials::CredentialResolver;
use crate::error::ConversationError;
use crate::inbound::{InboundEvent, InboundKind};
use crate::live_agent::LiveAgentDesk;
use crate::store::ConversationStore;

/// Which handler took the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Bot,
    LiveAgent,
    /// Message id already processed; nothing else happened.
    Duplicate,
}

/// Current routing status, creating the record with bot defaults on first contact.
pub async fn resolve_status(
    store: &ConversationStore,
    key: &ConversationKey,
    display_name: &str,
    now: i64,
) -> Result<ConversationStatus, ConversationError> {
    store
        .upsert(key, display_name, now, |r, created| {
            if created {
                log::info!("routing: new conversation {}", key);
            }
            Ok(r.status())
        })
        .await
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct Dispatcher {
    store: Arc<ConversationStore>,
    credentials: Arc<CredentialResolver>,
    bot: BotPath,
    desk: Arc<LiveAgentDesk>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ConversationStore>,
        credentials: Arc<CredentialResolver>,
        bot: BotPath,
        desk: Arc<LiveAgentDesk>,
    ) -> Self {
        Self {
            store,
            credentials,
            bot,
            desk,
        }
    }

    pub async fn route(&self, event: InboundEvent) -> Result<Dispatch, ConversationError> {
        self.route_at(event, now()).await
    }

    /// Route with an explicit clock (unix seconds).
    pub async fn route_at(
        &self,
        event: InboundEvent,
        now: i64,
    ) -> Result<Dispatch, ConversationError> {
        let key = &event.key;
        let status = resolve_status(&self.store, key, &event.display_name, now).await?;
        self.store
            .update(key, |r| {
                r.touch(now);
                Ok(())
            })
            .await?;

        let dispatch = match status {
            ConversationStatus::SpeakingWithBot | ConversationStatus::RequestedLiveAgent => {
                match self.credentials.resolve(&key.agent_id).await {
                    Ok(_) => Dispatch::Bot,
                    Err(ConversationError::CredentialsUnavailable(_)) => {
                        log::debug!(
                            "routing: no nlu credentials for agent {}, sending {} to live agents",
                            key.agent_id,
                            key
                        );
                        Dispatch::LiveAgent
                    }
                    Err(e) => return Err(e),
                }
            }
            ConversationStatus::SpeakingWithAgent => Dispatch::LiveAgent,
        };

        let result = match dispatch {
            Dispatch::Bot => self.to_bot(key, event.kind, now).await,
            _ => self.to_desk(key, event.kind, now).await,
        };
        match result {
            Ok(()) => Ok(dispatch),
            Err(ConversationError::DuplicateMessage(id)) => {
                log::debug!("routing: dropping duplicate message {} for {}", id, key);
                Ok(Dispatch::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    async fn to_bot(
        &self,
        key: &ConversationKey,
        kind: InboundKind,
        now: i64,
    ) -> Result<(), ConversationError> {
        match kind {
            InboundKind::Text { message_id, text } => {
                self.bot.handle_text(key, &message_id, &text, now).await
            }
            InboundKind::Suggestion { postback_data } => {
                self.bot.handle_suggestion(key, &postback_data, now).await
            }
            InboundKind::RequestedLiveAgent => self.bot.handle_live_agent_request(key).await,
            InboundKind::Typing { is_typing } => self.bot.handle_typing(key, is_typing).await,
        }
    }

    async fn to_desk(
        &self,
        key: &ConversationKey,
        kind: InboundKind,
        now: i64,
    ) -> Result<(), ConversationError> {
        match kind {
            InboundKind::Text { message_id, text } => {
                self.desk.handle_text(key, &message_id, &text, now).await
            }
            InboundKind::Suggestion { postback_data } => {
                self.desk.handle_suggestion(key, &postback_data, now).await
            }
            InboundKind::RequestedLiveAgent => self.desk.handle_live_agent_request(key).await,
            InboundKind::Typing { is_typing } => self.desk.handle_typing(key, is_typing).await,
        }
    }
}
