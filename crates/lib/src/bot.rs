//! Bot path: persist the user's message, ask the NLU backend, deliver its replies in order.
//!
//! Typing indicators bracket the NLU call. TYPING_STOPPED is sent even when the call fails,
//! and always before the first reply.

use std::sync::Arc;

use crate::conversation::{ConversationKey, MessageInfo, Sender};
use crate::credentials::CredentialResolver;
use crate::error::ConversationError;
use crate::live_agent::{DeskEvent, LiveAgentTransport};
use crate::messaging::{ConversationEvent, MessageSender, OutboundMessage, Representative};
use crate::nlu::{self, NluBackend};
use crate::store::ConversationStore;

pub struct BotPath {
    store: Arc<ConversationStore>,
    credentials: Arc<CredentialResolver>,
    sender: Arc<dyn MessageSender>,
    nlu: Arc<dyn NluBackend>,
    transport: Arc<dyn LiveAgentTransport>,
}

impl BotPath {
    pub fn new(
        store: Arc<ConversationStore>,
        credentials: Arc<CredentialResolver>,
        sender: Arc<dyn MessageSender>,
        nlu: Arc<dyn NluBackend>,
        transport: Arc<dyn LiveAgentTransport>,
    ) -> Self {
        Self {
            store,
            credentials,
            sender,
            nlu,
            transport,
        }
    }

    /// Text message: dedup on `message_id`, persist as USER, then answer through the NLU.
    pub async fn handle_text(
        &self,
        key: &ConversationKey,
        message_id: &str,
        text: &str,
        now: i64,
    ) -> Result<(), ConversationError> {
        self.store
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
                Ok(())
            })
            .await?;
        self.answer(key, text, now).await;
        Ok(())
    }

    /// Suggestion tap: the postback is treated as the text. No redelivery id, so no dedup.
    pub async fn handle_suggestion(
        &self,
        key: &ConversationKey,
        postback_data: &str,
        now: i64,
    ) -> Result<(), ConversationError> {
        self.store
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
                Ok(())
            })
            .await?;
        self.answer(key, postback_data, now).await;
        Ok(())
    }

    /// User asked for a human. Only the state changes; the desk is told so someone can join.
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
        log::info!("bot: live agent requested for {}", key);
        self.transport
            .forward(DeskEvent::LiveAgentRequested {
                key: key.clone(),
                display_name,
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
            .await
    }

    /// NLU round trip and ordered delivery. Failures are logged, not returned: the inbound
    /// event was already accepted and persisted.
    async fn answer(&self, key: &ConversationKey, text: &str, now: i64) {
        let credentials = match self.credentials.resolve(&key.agent_id).await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("bot: {}; no reply for {}", e, key);
                return;
            }
        };

        self.send_typing(key, true).await;
        let result = self
            .nlu
            .detect_intent(&credentials, &key.conversation_id, text)
            .await;
        self.send_typing(key, false).await;

        let fulfillments = match result {
            Ok(f) => f,
            Err(e) => {
                log::warn!("bot: nlu call failed for {}: {}", key, e);
                return;
            }
        };
        let messages: Vec<OutboundMessage> =
            fulfillments.into_iter().filter_map(nlu::to_outbound).collect();
        log::debug!("bot: delivering {} message(s) to {}", messages.len(), key);
        self.deliver_in_order(key, messages, now).await;
    }

    /// Send one at a time. After the first failure nothing more is sent, so the user never
    /// sees a later reply without the earlier one; unsent replies are still logged in history.
    async fn deliver_in_order(&self, key: &ConversationKey, messages: Vec<OutboundMessage>, now: i64) {
        let mut delivering = true;
        for message in messages {
            let sent = if delivering {
                match self
                    .sender
                    .send_message(&key.conversation_id, &message)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!(
                            "bot: delivery of {} to {} failed: {}",
                            message.message_id,
                            key,
                            e
                        );
                        delivering = false;
                        false
                    }
                }
            } else {
                false
            };
            let info = message.history_info();
            if let Err(e) = self
                .store
                .update(key, |r| {
                    r.push_message(Sender::Bot, info, sent, now);
                    Ok(())
                })
                .await
            {
                log::warn!("bot: failed to record reply for {}: {}", key, e);
            }
        }
    }

    async fn send_typing(&self, key: &ConversationKey, is_typing: bool) {
        let event = ConversationEvent::typing(is_typing, Representative::bot());
        if let Err(e) = self.sender.send_event(&key.conversation_id, &event).await {
            log::debug!("bot: typing event for {} failed: {}", key, e);
        }
    }
}
