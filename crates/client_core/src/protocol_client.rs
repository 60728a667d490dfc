use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::{ConversationKey, MessageId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        EditMessageRequest, HistoryQuery, MarkSeenRequest, MessagePayload, SendMessageRequest,
    },
};
use url::Url;

use crate::ChatBackend;

const MAX_HISTORY_LIMIT: u32 = 200;

/// REST client for the chat service, authenticated as one user.
pub struct HttpChatBackend {
    http: Client,
    server_url: String,
    user_id: UserId,
}

impl HttpChatBackend {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self::with_client(Client::new(), server_url, user_id)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            user_id,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot carry a path: {}", self.server_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Turns a non-2xx response into an error, preferring the service's own
/// error envelope when the body carries one.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow::Error::new(ApiException::from(api_error))
            .context(format!("chat service returned {status}"))),
        Err(_) => Err(anyhow!("chat service returned {status}: {body}")),
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn fetch_history(
        &self,
        conversation: ConversationKey,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let peer_id = conversation.peer_of(self.user_id).ok_or_else(|| {
            anyhow!(
                "user {} is not a participant of conversation {conversation}",
                self.user_id
            )
        })?;
        let query = HistoryQuery {
            user_id: self.user_id,
            peer_id,
            project_id: conversation.project_id(),
            limit: limit.clamp(1, MAX_HISTORY_LIMIT),
            before,
        };
        let response = self
            .http
            .get(self.url(&["conversations", "messages"])?)
            .query(&query)
            .send()
            .await
            .context("failed to fetch message history")?;
        let messages = check_status(response).await?.json().await?;
        Ok(messages)
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<MessagePayload> {
        let response = self
            .http
            .post(self.url(&["messages"])?)
            .json(&request)
            .send()
            .await
            .context("failed to send message")?;
        let message = check_status(response).await?.json().await?;
        Ok(message)
    }

    async fn edit_message(&self, id: &MessageId, body: &str) -> Result<MessagePayload> {
        let response = self
            .http
            .patch(self.url(&["messages", id.as_str()])?)
            .json(&EditMessageRequest {
                user_id: self.user_id,
                body: body.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("failed to edit message {id}"))?;
        let message = check_status(response).await?.json().await?;
        Ok(message)
    }

    async fn delete_message(&self, id: &MessageId) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&["messages", id.as_str()])?)
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await
            .with_context(|| format!("failed to delete message {id}"))?;
        check_status(response).await?;
        Ok(())
    }

    async fn mark_seen(&self, message_ids: &[MessageId]) -> Result<()> {
        let response = self
            .http
            .post(self.url(&["messages", "seen"])?)
            .json(&MarkSeenRequest {
                performer_id: self.user_id,
                message_ids: message_ids.to_vec(),
            })
            .send()
            .await
            .context("failed to mark messages seen")?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/protocol_client_tests.rs"]
mod tests;
