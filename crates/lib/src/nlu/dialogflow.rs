//! Dialogflow ES client: `projects/{project}/agent/sessions/{session}:detectIntent`.
//!
//! The bearer token is read from the agent's credential blob (`accessToken`); minting
//! tokens from service accounts happens outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Fulfillment, NluBackend, NluError};
use crate::credentials::AgentCredentials;

const DEFAULT_BASE_URL: &str = "https://dialogflow.googleapis.com/v2";
const DEFAULT_LANGUAGE_CODE: &str = "en";

#[derive(Clone)]
pub struct DialogflowClient {
    base_url: String,
    language_code: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectIntentRequest<'a> {
    query_input: QueryInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryInput<'a> {
    text: TextInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TextInput<'a> {
    text: &'a str,
    language_code: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectIntentResponse {
    #[serde(default)]
    query_result: Option<QueryResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResult {
    #[serde(default)]
    fulfillment_text: Option<String>,
    #[serde(default)]
    fulfillment_messages: Vec<FulfillmentMessage>,
}

#[derive(Debug, Deserialize)]
struct FulfillmentMessage {
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    text: Option<TextMessage>,
}

#[derive(Debug, Deserialize)]
struct TextMessage {
    #[serde(default)]
    text: Vec<String>,
}

impl DialogflowClient {
    pub fn new(base_url: Option<String>, language_code: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let language_code = language_code
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE_CODE.to_string());
        Self {
            base_url,
            language_code,
            client: reqwest::Client::new(),
        }
    }

    fn session_url(&self, project_id: &str, session_id: &str) -> String {
        format!(
            "{}/projects/{}/agent/sessions/{}:detectIntent",
            self.base_url, project_id, session_id
        )
    }
}

fn access_token(credentials: &AgentCredentials) -> Result<&str, NluError> {
    credentials
        .credentials
        .get("accessToken")
        .and_then(|v| v.as_str())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            NluError::Credentials(format!(
                "no accessToken for project {}",
                credentials.project_id
            ))
        })
}

/// Flatten a query result into fulfillments, keeping the order Dialogflow returned.
fn fulfillments(result: QueryResult) -> Vec<Fulfillment> {
    let mut out = Vec::new();
    for message in result.fulfillment_messages {
        if let Some(payload) = message.payload {
            out.push(Fulfillment::Payload(payload));
        } else if let Some(text) = message.text {
            out.extend(text.text.into_iter().map(Fulfillment::Text));
        }
    }
    if out.is_empty() {
        if let Some(text) = result.fulfillment_text.filter(|t| !t.trim().is_empty()) {
            out.push(Fulfillment::Text(text));
        }
    }
    out
}

#[async_trait]
impl NluBackend for DialogflowClient {
    async fn detect_intent(
        &self,
        credentials: &AgentCredentials,
        session_id: &str,
        text: &str,
    ) -> Result<Vec<Fulfillment>, NluError> {
        let token = access_token(credentials)?;
        let url = self.session_url(&credentials.project_id, session_id);
        let body = DetectIntentRequest {
            query_input: QueryInput {
                text: TextInput {
                    text,
                    language_code: &self.language_code,
                },
            },
        };
        let res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(NluError::Api(format!("{} {}", status, body)));
        }
        let data: DetectIntentResponse = res.json().await?;
        Ok(fulfillments(data.query_result.unwrap_or_default()))
    }
}
