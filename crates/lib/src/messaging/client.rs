//! Business Messages REST client: messages, events and surveys per conversation.

use async_trait::async_trait;

use super::{ConversationEvent, DeliveryError, MessageSender, OutboundMessage};

const DEFAULT_BASE_URL: &str = "https://businessmessages.googleapis.com/v1";

#[derive(Clone)]
pub struct BusinessMessagesClient {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl BusinessMessagesClient {
    pub fn new(base_url: Option<String>, access_token: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            access_token,
            client: reqwest::Client::new(),
        }
    }

    fn conversation_url(&self, conversation_id: &str, resource: &str) -> String {
        format!(
            "{}/conversations/{}/{}",
            self.base_url, conversation_id, resource
        )
    }

    /// POST a JSON body; non-2xx responses become `DeliveryError::Api` with status and body.
    async fn post(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| DeliveryError::NotConfigured("messaging access token".to_string()))?;
        let res = self
            .client
            .post(url)
            .query(query)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(DeliveryError::Api(format!("{} {}", status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSender for BusinessMessagesClient {
    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        let url = self.conversation_url(conversation_id, "messages");
        let body = serde_json::to_value(message).map_err(|e| DeliveryError::Api(e.to_string()))?;
        self.post(&url, &[], &body).await?;
        log::debug!(
            "messaging: sent message {} to {}",
            message.message_id,
            conversation_id
        );
        Ok(())
    }

    async fn send_event(
        &self,
        conversation_id: &str,
        event: &ConversationEvent,
    ) -> Result<(), DeliveryError> {
        let url = self.conversation_url(conversation_id, "events");
        let event_id = uuid::Uuid::new_v4().to_string();
        let body = serde_json::to_value(event).map_err(|e| DeliveryError::Api(e.to_string()))?;
        self.post(&url, &[("eventId", event_id.as_str())], &body)
            .await
    }

    async fn create_survey(&self, conversation_id: &str) -> Result<(), DeliveryError> {
        let url = self.conversation_url(conversation_id, "surveys");
        let survey_id = uuid::Uuid::new_v4().to_string();
        self.post(&url, &[("surveyId", survey_id.as_str())], &serde_json::json!({}))
            .await?;
        log::info!("messaging: survey {} created for {}", survey_id, conversation_id);
        Ok(())
    }
}
