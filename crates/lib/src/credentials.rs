//! Per-agent NLU credentials and the survey threshold that travels with them.
//!
//! Credentials come either from the store's administrative partition or from the static
//! `nlu.agents` map in config, selected by `nlu.credentialSource`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConversationError;
use crate::store::ConversationStore;

pub const DEFAULT_SURVEY_THRESHOLD_MINUTES: u64 = 15;

/// Credential record for one agent. `credentials` is opaque here; the NLU client reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCredentials {
    pub project_id: String,
    #[serde(default)]
    pub credentials: serde_json::Value,
    /// Minutes of inactivity before a survey; number or numeric string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survey_threshold: Option<serde_json::Value>,
}

impl AgentCredentials {
    /// Parsed survey threshold, or None when missing or not a positive whole number.
    pub fn survey_threshold_minutes(&self) -> Option<u64> {
        let minutes = match self.survey_threshold.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }?;
        (minutes > 0).then_some(minutes)
    }
}

/// Where agent credentials are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    #[default]
    Store,
    Config,
}

pub struct CredentialResolver {
    source: CredentialSource,
    store: Arc<ConversationStore>,
    static_agents: HashMap<String, AgentCredentials>,
}

impl CredentialResolver {
    pub fn new(
        source: CredentialSource,
        store: Arc<ConversationStore>,
        static_agents: HashMap<String, AgentCredentials>,
    ) -> Self {
        Self {
            source,
            store,
            static_agents,
        }
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub async fn resolve(&self, agent_id: &str) -> Result<AgentCredentials, ConversationError> {
        let found = match self.source {
            CredentialSource::Store => self.store.credentials(agent_id).await,
            CredentialSource::Config => self.static_agents.get(agent_id).cloned(),
        };
        found
            .filter(|c| !c.project_id.trim().is_empty())
            .ok_or_else(|| ConversationError::CredentialsUnavailable(agent_id.to_string()))
    }

    /// Survey threshold for an agent, falling back to `default_minutes`.
    pub async fn survey_threshold(&self, agent_id: &str, default_minutes: u64) -> u64 {
        let configured = match self.source {
            CredentialSource::Store => self.store.credentials(agent_id).await,
            CredentialSource::Config => self.static_agents.get(agent_id).cloned(),
        }
        .and_then(|c| c.survey_threshold_minutes());
        configured.unwrap_or(default_minutes)
    }
}
