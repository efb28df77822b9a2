//! HistoryLoader: request/response access to conversations and messages.
//!
//! Every call carries the bearer credential. Calls have no side effects on
//! local state; the orchestrator decides what to do with the results.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::models::{Conversation, Credential, Message};

/// The chat server's request/response surface.
#[async_trait]
pub trait ConversationApi: Send + Sync + 'static {
    /// Most recently updated first.
    async fn list_conversations(&self, credential: &Credential) -> SyncResult<Vec<Conversation>>;

    async fn create_conversation(
        &self,
        credential: &Credential,
        title: Option<&str>,
    ) -> SyncResult<Conversation>;

    /// Full message history in server order.
    async fn load_messages(
        &self,
        credential: &Credential,
        conversation_id: &str,
    ) -> SyncResult<Vec<Message>>;

    async fn delete_conversation(
        &self,
        credential: &Credential,
        conversation_id: &str,
    ) -> SyncResult<()>;
}

#[derive(Serialize)]
struct CreateConversationRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

/// FastAPI-style error body.
#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

pub struct HistoryLoader {
    client: reqwest::Client,
    base_url: String,
}

impl HistoryLoader {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SyncError::from_reqwest)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map non-success statuses onto the error taxonomy.
    async fn check_status(resp: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::SessionInvalid);
        }
        let text = resp.text().await.unwrap_or_default();
        let body = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(ErrorBody {
                detail: serde_json::Value::String(detail),
            }) => detail,
            Ok(ErrorBody { detail }) => detail.to_string(),
            Err(_) => text,
        };
        Err(SyncError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
    ) -> SyncResult<T> {
        let resp = self
            .client
            .get(self.url(path))
            .header(reqwest::header::AUTHORIZATION, credential.bearer())
            .send()
            .await
            .map_err(SyncError::from_reqwest)?;
        let resp = Self::check_status(resp).await?;
        resp.json().await.map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ConversationApi for HistoryLoader {
    async fn list_conversations(&self, credential: &Credential) -> SyncResult<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> =
            self.get_json(credential, "/conversations").await?;
        // Stable: equal timestamps keep server order.
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        debug!(count = conversations.len(), "listed conversations");
        Ok(conversations)
    }

    async fn create_conversation(
        &self,
        credential: &Credential,
        title: Option<&str>,
    ) -> SyncResult<Conversation> {
        let resp = self
            .client
            .post(self.url("/conversations"))
            .header(reqwest::header::AUTHORIZATION, credential.bearer())
            .json(&CreateConversationRequest { title })
            .send()
            .await
            .map_err(SyncError::from_reqwest)?;
        let resp = Self::check_status(resp).await?;
        let conversation: Conversation = resp
            .json()
            .await
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        debug!(conversation = %conversation.id, "created conversation");
        Ok(conversation)
    }

    async fn load_messages(
        &self,
        credential: &Credential,
        conversation_id: &str,
    ) -> SyncResult<Vec<Message>> {
        let path = format!("/conversations/{}/messages", urlencoding::encode(conversation_id));
        let messages: Vec<Message> = self.get_json(credential, &path).await?;
        debug!(conversation = %conversation_id, count = messages.len(), "loaded history");
        Ok(messages)
    }

    async fn delete_conversation(
        &self,
        credential: &Credential,
        conversation_id: &str,
    ) -> SyncResult<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/conversations/{}", urlencoding::encode(conversation_id))))
            .header(reqwest::header::AUTHORIZATION, credential.bearer())
            .send()
            .await
            .map_err(SyncError::from_reqwest)?;
        Self::check_status(resp).await?;
        debug!(conversation = %conversation_id, "deleted conversation");
        Ok(())
    }
}
