use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::api::ConversationApi;
use crate::chat::{AppendRequest, ConversationSummary, Message};
use crate::entity::{AdminKey, Sender, SessionId};
use crate::error::{SyncError, SyncResult};
use crate::server::{ErrorBody, MarkReadBody, MessagesResponse, PostMessageBody, ADMIN_KEY_HEADER};

/// Talks to a remote `chatsync` server.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, session_id: Option<&SessionId>) -> SyncResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        debug!("Request failed with {}: {}", status, detail);

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::AuthExpired,
            StatusCode::NOT_FOUND => match session_id {
                Some(id) => SyncError::not_found(id),
                None => SyncError::Network(detail),
            },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SyncError::Rejected(detail),
            _ => SyncError::Network(detail),
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> SyncResult<T> {
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ConversationApi for HttpTransport {
    async fn get_conversation(&self, session_id: &SessionId) -> SyncResult<Vec<Message>> {
        let request = self.client.get(self.url(&format!("/api/chat/{}", session_id)));
        let response = self.send(request, Some(session_id)).await?;
        let body: MessagesResponse = Self::json(response).await?;
        Ok(body.messages)
    }

    async fn append_message(&self, req: AppendRequest) -> SyncResult<Message> {
        let body = PostMessageBody {
            text: req.text,
            display_name: req.display_name,
        };

        let request = match req.sender {
            Sender::User => self
                .client
                .post(self.url(&format!("/api/chat/{}", req.session_id))),
            Sender::Admin => {
                let key = req.auth.ok_or(SyncError::AuthExpired)?;
                self.client
                    .post(self.url(&format!("/api/admin/conversations/{}/messages", req.session_id)))
                    .header(ADMIN_KEY_HEADER, key.expose())
            }
        };

        let response = self.send(request.json(&body), Some(&req.session_id)).await?;
        Self::json(response).await
    }

    async fn list_conversations(&self, auth: &AdminKey) -> SyncResult<Vec<ConversationSummary>> {
        let request = self
            .client
            .get(self.url("/api/admin/conversations"))
            .header(ADMIN_KEY_HEADER, auth.expose());
        let response = self.send(request, None).await?;
        Self::json(response).await
    }

    async fn mark_read(&self, session_id: &SessionId, seen: DateTime<Utc>, auth: &AdminKey) -> SyncResult<()> {
        let request = self
            .client
            .post(self.url(&format!("/api/admin/conversations/{}/read", session_id)))
            .header(ADMIN_KEY_HEADER, auth.expose())
            .json(&MarkReadBody { seen });
        self.send(request, Some(session_id)).await?;
        Ok(())
    }

    async fn delete_conversation(&self, session_id: &SessionId, auth: &AdminKey) -> SyncResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("/api/admin/conversations/{}", session_id)))
            .header(ADMIN_KEY_HEADER, auth.expose());
        self.send(request, Some(session_id)).await?;
        Ok(())
    }
}
