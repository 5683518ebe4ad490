use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, LocalId, Message},
    error::ApiError,
    protocol::{ConversationSummary, PostMessageBody, WireMessage},
};
use tracing::warn;
use url::Url;

use crate::error::RestError;

/// The backend's HTTP contract as the sync core consumes it.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RestError>;

    /// Fallback send path used while the real-time transport is down.
    async fn post_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        local_id: &LocalId,
    ) -> Result<Message, RestError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RestError>;
}

pub struct RestClient {
    http: Client,
    base_url: Url,
    session_token: String,
}

impl RestClient {
    pub fn new(base_url: Url, session_token: impl Into<String>) -> Result<Self, RestError> {
        if base_url.cannot_be_a_base() {
            return Err(RestError::InvalidBase(base_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            session_token: session_token.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RestError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RestError::InvalidBase(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RestError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
                return Err(RestError::Api(api_error));
            }
            return Err(RestError::Status {
                status: status.as_u16(),
                message: body,
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| RestError::Decode(err.to_string()))
    }
}

#[async_trait]
impl ConversationApi for RestClient {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RestError> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "history"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.session_token)
            .send()
            .await?;
        let page: Vec<WireMessage> = Self::decode(response).await?;

        let mut messages = Vec::with_capacity(page.len());
        for wire in page {
            match Message::try_from(wire) {
                Ok(message) if &message.conversation_id == conversation_id => messages.push(message),
                Ok(message) => warn!(
                    conversation_id = %conversation_id,
                    message_conversation_id = %message.conversation_id,
                    "rest: dropping history entry for another conversation"
                ),
                Err(err) => warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "rest: dropping malformed history entry"
                ),
            }
        }
        Ok(messages)
    }

    async fn post_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        local_id: &LocalId,
    ) -> Result<Message, RestError> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.session_token)
            .json(&PostMessageBody {
                content: content.to_string(),
                local_id: local_id.clone(),
            })
            .send()
            .await?;
        let wire: WireMessage = Self::decode(response).await?;
        Message::try_from(wire).map_err(|err| RestError::Decode(err.to_string()))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RestError> {
        let url = self.endpoint(&["conversations"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.session_token)
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
