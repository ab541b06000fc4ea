//! Shared fakes for integration tests: a recording sender, a scripted NLU and a desk transport.

#![allow(dead_code)]

use async_trait::async_trait;
use handoff::bot::BotPath;
use handoff::conversation::ConversationKey;
use handoff::credentials::{AgentCredentials, CredentialResolver, CredentialSource};
use handoff::inbound::{InboundEvent, InboundKind};
use handoff::live_agent::{DeskEvent, LiveAgentDesk, LiveAgentTransport};
use handoff::messaging::{ConversationEvent, DeliveryError, EventType, MessageSender, OutboundMessage};
use handoff::nlu::{Fulfillment, NluBackend, NluError};
use handoff::routing::Dispatcher;
use handoff::store::ConversationStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One outbound call, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Message { conversation_id: String, text: Option<String> },
    Event { conversation_id: String, event_type: EventType },
    Survey { conversation_id: String },
}

/// Records every outbound call. Message sends fail once `fail_messages_after` succeeded.
#[derive(Default)]
pub struct RecordingSender {
    pub calls: Mutex<Vec<Call>>,
    pub fail_messages_after: Mutex<Option<usize>>,
    pub fail_surveys_for: Mutex<Vec<String>>,
    pub fail_events: Mutex<bool>,
    sent_messages: Mutex<usize>,
}

impl RecordingSender {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn surveys(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Survey { conversation_id } => Some(conversation_id),
                _ => None,
            })
            .collect()
    }

    pub fn message_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Message { text, .. } => text,
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        let limit = *self.fail_messages_after.lock().unwrap();
        let mut sent = self.sent_messages.lock().unwrap();
        if limit.map_or(false, |n| *sent >= n) {
            return Err(DeliveryError::Api("503 unavailable".to_string()));
        }
        *sent += 1;
        self.calls.lock().unwrap().push(Call::Message {
            conversation_id: conversation_id.to_string(),
            text: message.text.clone(),
        });
        Ok(())
    }

    async fn send_event(
        &self,
        conversation_id: &str,
        event: &ConversationEvent,
    ) -> Result<(), DeliveryError> {
        if *self.fail_events.lock().unwrap() {
            return Err(DeliveryError::Api("event rejected".to_string()));
        }
        self.calls.lock().unwrap().push(Call::Event {
            conversation_id: conversation_id.to_string(),
            event_type: event.event_type,
        });
        Ok(())
    }

    async fn create_survey(&self, conversation_id: &str) -> Result<(), DeliveryError> {
        if self
            .fail_surveys_for
            .lock()
            .unwrap()
            .iter()
            .any(|c| c == conversation_id)
        {
            return Err(DeliveryError::Api("survey rejected".to_string()));
        }
        self.calls.lock().unwrap().push(Call::Survey {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }
}

/// Returns the same fulfillments for every query, or an error when `fail` is set.
#[derive(Default)]
pub struct ScriptedNlu {
    pub replies: Mutex<Vec<Fulfillment>>,
    pub fail: Mutex<bool>,
    pub queries: Mutex<Vec<String>>,
}

impl ScriptedNlu {
    pub fn replying(texts: &[&str]) -> Self {
        let nlu = Self::default();
        *nlu.replies.lock().unwrap() = texts.iter().map(|t| Fulfillment::Text(t.to_string())).collect();
        nlu
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl NluBackend for ScriptedNlu {
    async fn detect_intent(
        &self,
        _credentials: &AgentCredentials,
        _session_id: &str,
        text: &str,
    ) -> Result<Vec<Fulfillment>, NluError> {
        self.queries.lock().unwrap().push(text.to_string());
        if *self.fail.lock().unwrap() {
            return Err(NluError::Api("500 internal".to_string()));
        }
        Ok(self.replies.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    pub events: Mutex<Vec<DeskEvent>>,
}

impl RecordingTransport {
    pub fn events(&self) -> Vec<DeskEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveAgentTransport for RecordingTransport {
    async fn forward(&self, event: DeskEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn creds(threshold: Option<serde_json::Value>) -> AgentCredentials {
    AgentCredentials {
        project_id: "proj-1".to_string(),
        credentials: serde_json::json!({"accessToken": "t"}),
        survey_threshold: threshold,
    }
}

/// Everything wired together over an in-memory store.
pub struct Harness {
    pub store: Arc<ConversationStore>,
    pub credentials: Arc<CredentialResolver>,
    pub sender: Arc<RecordingSender>,
    pub nlu: Arc<ScriptedNlu>,
    pub transport: Arc<RecordingTransport>,
    pub desk: Arc<LiveAgentDesk>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(nlu: ScriptedNlu) -> Self {
        Self::with_agents(nlu, CredentialSource::Store, HashMap::new())
    }

    pub fn with_agents(
        nlu: ScriptedNlu,
        source: CredentialSource,
        agents: HashMap<String, AgentCredentials>,
    ) -> Self {
        let store = Arc::new(ConversationStore::new());
        let credentials = Arc::new(CredentialResolver::new(source, store.clone(), agents));
        let sender = Arc::new(RecordingSender::default());
        let nlu = Arc::new(nlu);
        let transport = Arc::new(RecordingTransport::default());
        let desk = Arc::new(LiveAgentDesk::new(
            store.clone(),
            sender.clone(),
            transport.clone(),
        ));
        let bot = BotPath::new(
            store.clone(),
            credentials.clone(),
            sender.clone(),
            nlu.clone(),
            transport.clone(),
        );
        let dispatcher = Dispatcher::new(store.clone(), credentials.clone(), bot, desk.clone());
        Self {
            store,
            credentials,
            sender,
            nlu,
            transport,
            desk,
            dispatcher,
        }
    }
}

pub fn key() -> ConversationKey {
    ConversationKey::new("agent-1", "conv-1")
}

pub fn text(message_id: &str, body: &str) -> InboundEvent {
    InboundEvent {
        key: key(),
        display_name: "Ada".to_string(),
        kind: InboundKind::Text {
            message_id: message_id.to_string(),
            text: body.to_string(),
        },
    }
}

pub fn event(kind: InboundKind) -> InboundEvent {
    InboundEvent {
        key: key(),
        display_name: "Ada".to_string(),
        kind,
    }
}
