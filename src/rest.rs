// REST client for the chat API (base /api/v1/chat/).
// REST is the authoritative side of the sync engine: pages fetched here are
// the correctness backstop for anything the WebSocket failed to deliver.

use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::models::{Conversation, Message, Priority};

/// Standard paginated response wrapper used by every list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub count: usize,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// Query options for paginated list endpoints.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub page: usize,
    pub page_size: usize,
}

impl PageQuery {
    pub fn new() -> Self {
        PageQuery {
            page: 1,
            page_size: 50, // Default page size
        }
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.page = page.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, 100);
        self
    }
}

impl Default for PageQuery {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewConversation {
    pub subject: String,
    pub participant_ids: Vec<i64>,
    pub priority: Priority,
}

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Client-generated identity; the server echoes it back so the merge
    /// can dedup the REST response against the WebSocket echo.
    pub uuid: Uuid,
    pub content: String,
    pub attachment: Option<AttachmentUpload>,
}

impl OutgoingMessage {
    pub fn text(content: &str) -> Self {
        OutgoingMessage {
            uuid: Uuid::new_v4(),
            content: content.to_string(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkReadResponse {
    pub marked_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnreadCountResponse {
    pub unread_count: u32,
}

pub struct RestClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(config: &ChatConfig) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ChatError::Transient(format!("HTTP client: {}", e)))?;

        Ok(RestClient {
            http,
            api_base: config.api_base.clone(),
            token: config.token.clone(),
        })
    }

    fn token(&self) -> Result<&str, ChatError> {
        self.token.as_deref().ok_or(ChatError::Unauthenticated)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("REST call rejected with 401 - session expired");
            return Err(ChatError::AuthExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    pub async fn list_conversations(
        &self,
        query: &PageQuery,
    ) -> Result<Page<Conversation>, ChatError> {
        let token = self.token()?;
        debug!("Fetching conversation page {}", query.page);
        let response = self
            .http
            .get(self.url("conversations/"))
            .bearer_auth(token)
            .query(&[("page", query.page), ("page_size", query.page_size)])
            .send()
            .await?;
        let page = Self::check(response).await?.json().await?;
        Ok(page)
    }

    pub async fn list_messages(
        &self,
        conversation: Uuid,
        query: &PageQuery,
    ) -> Result<Page<Message>, ChatError> {
        let token = self.token()?;
        debug!(
            "Fetching message page {} for conversation {}",
            query.page, conversation
        );
        let response = self
            .http
            .get(self.url(&format!("conversations/{}/messages/", conversation)))
            .bearer_auth(token)
            .query(&[("page", query.page), ("page_size", query.page_size)])
            .send()
            .await?;
        let page = Self::check(response).await?.json().await?;
        Ok(page)
    }

    pub async fn create_conversation(
        &self,
        new: &NewConversation,
    ) -> Result<Conversation, ChatError> {
        let token = self.token()?;
        info!("Creating conversation '{}'", new.subject);
        let response = self
            .http
            .post(self.url("conversations/"))
            .bearer_auth(token)
            .json(new)
            .send()
            .await?;
        let conversation = Self::check(response).await?.json().await?;
        Ok(conversation)
    }

    /// Send a message. Plain JSON for text; multipart when an attachment
    /// is present.
    pub async fn send_message(
        &self,
        conversation: Uuid,
        outgoing: &OutgoingMessage,
    ) -> Result<Message, ChatError> {
        let token = self.token()?;
        let url = self.url(&format!("conversations/{}/messages/", conversation));

        let response = match &outgoing.attachment {
            Some(attachment) => {
                let part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                    .file_name(attachment.file_name.clone())
                    .mime_str(&attachment.content_type)
                    .map_err(|e| ChatError::Protocol(format!("bad attachment mime: {}", e)))?;
                let form = reqwest::multipart::Form::new()
                    .text("uuid", outgoing.uuid.to_string())
                    .text("content", outgoing.content.clone())
                    .part("attachment", part);
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .multipart(form)
                    .send()
                    .await?
            }
            None => {
                let body = serde_json::json!({
                    "uuid": outgoing.uuid,
                    "content": outgoing.content,
                });
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
                    .await?
            }
        };

        let message = Self::check(response).await?.json().await?;
        Ok(message)
    }

    pub async fn mark_read(&self, conversation: Uuid) -> Result<MarkReadResponse, ChatError> {
        let token = self.token()?;
        debug!("Marking conversation {} read", conversation);
        let response = self
            .http
            .post(self.url(&format!("conversations/{}/mark_read/", conversation)))
            .bearer_auth(token)
            .send()
            .await?;
        let marked = Self::check(response).await?.json().await?;
        Ok(marked)
    }

    pub async fn unread_count(&self) -> Result<UnreadCountResponse, ChatError> {
        let token = self.token()?;
        let response = self
            .http
            .get(self.url("conversations/unread_count/"))
            .bearer_auth(token)
            .send()
            .await?;
        let count = Self::check(response).await?.json().await?;
        Ok(count)
    }

    pub async fn search_conversations(
        &self,
        q: &str,
        query: &PageQuery,
    ) -> Result<Page<Conversation>, ChatError> {
        let token = self.token()?;
        let response = self
            .http
            .get(self.url("conversations/search/"))
            .bearer_auth(token)
            .query(&[("q", q)])
            .query(&[("page", query.page), ("page_size", query.page_size)])
            .send()
            .await?;
        let page = Self::check(response).await?.json().await?;
        Ok(page)
    }
}
