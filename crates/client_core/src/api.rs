use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde_json::Value;
use shared::{
    error::ApiError,
    protocol::{
        extract_record_list, ApiResponse, ChannelSummary, EditMessageRequest, SendMessageRequest,
    },
    ChannelId, EventEnvelope, UserProfile,
};
use tracing::{debug, warn};

use crate::error::{FetchError, SendError};

pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        let token = self.0.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub content: String,
    pub thread_parent_id: Option<i64>,
}

#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        limit: u32,
    ) -> Result<Vec<EventEnvelope>, FetchError>;

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<Option<EventEnvelope>, SendError>;

    async fn send_file(
        &self,
        channel_id: &ChannelId,
        upload: &FileUpload,
    ) -> Result<Option<EventEnvelope>, SendError>;

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: i64,
        request: &EditMessageRequest,
    ) -> Result<(), SendError>;

    async fn delete_message(&self, channel_id: &ChannelId, message_id: i64)
        -> Result<(), SendError>;

    async fn fetch_channels(&self) -> Result<Vec<ChannelSummary>, FetchError>;

    async fn fetch_users(&self) -> Result<Vec<UserProfile>, FetchError>;
}

pub fn numeric_message_id(id: &str) -> Option<i64> {
    let id = id.trim();
    id.strip_prefix("msg-").unwrap_or(id).parse().ok()
}

pub struct HttpMessagingApi {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpMessagingApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_client(Client::new(), base_url, tokens)
    }

    pub fn with_client(
        http: Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> Option<RequestBuilder> {
        self.tokens
            .bearer_token()
            .map(|token| request.bearer_auth(token))
    }

    async fn get_records(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<Value>, FetchError> {
        let request = self
            .authorized(self.http.get(format!("{}{path}", self.base_url)).query(query))
            .ok_or(FetchError::NotSignedIn)?;
        let response = request.send().await?;
        let body: Value = ensure_success(response).await?.json().await?;
        extract_record_list(body)
            .ok_or_else(|| FetchError::UnexpectedBody(format!("{path} did not return a list")))
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        limit: u32,
    ) -> Result<Vec<EventEnvelope>, FetchError> {
        let records = self
            .get_records(
                &format!("/channels/{channel_id}/messages"),
                &[("limit", limit.to_string())],
            )
            .await?;
        let total = records.len();
        let messages: Vec<EventEnvelope> = records
            .into_iter()
            .filter_map(|record| message_record(record, channel_id))
            .collect();
        debug!(
            channel_id = %channel_id,
            total,
            kept = messages.len(),
            "fetched channel messages"
        );
        Ok(messages)
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<Option<EventEnvelope>, SendError> {
        let builder = self
            .authorized(
                self.http
                    .post(format!("{}/channels/{channel_id}/messages", self.base_url))
                    .json(request),
            )
            .ok_or(SendError::NotSignedIn)?;
        let response = ensure_success(builder.send().await?).await?;
        acknowledged_record(response, channel_id).await
    }

    async fn send_file(
        &self,
        channel_id: &ChannelId,
        upload: &FileUpload,
    ) -> Result<Option<EventEnvelope>, SendError> {
        let part = multipart::Part::bytes(upload.bytes.clone())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime_type)?;
        let mut form = multipart::Form::new().part("files", part);
        if !upload.content.is_empty() {
            form = form.text("content", upload.content.clone());
        }
        if let Some(parent) = upload.thread_parent_id {
            form = form.text("thread_parent_id", parent.to_string());
        }

        let builder = self
            .authorized(
                self.http
                    .post(format!("{}/channels/files", self.base_url))
                    .query(&[("channelId", channel_id.as_str())])
                    .multipart(form),
            )
            .ok_or(SendError::NotSignedIn)?;
        let response = ensure_success(builder.send().await?).await?;
        acknowledged_record(response, channel_id).await
    }

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: i64,
        request: &EditMessageRequest,
    ) -> Result<(), SendError> {
        let builder = self
            .authorized(
                self.http
                    .put(format!(
                        "{}/channels/{channel_id}/messages/{message_id}",
                        self.base_url
                    ))
                    .json(request),
            )
            .ok_or(SendError::NotSignedIn)?;
        let response = ensure_success(builder.send().await?).await?;
        acknowledged_record(response, channel_id).await.map(|_| ())
    }

    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: i64,
    ) -> Result<(), SendError> {
        let builder = self
            .authorized(self.http.delete(format!(
                "{}/channels/{channel_id}/messages/{message_id}",
                self.base_url
            )))
            .ok_or(SendError::NotSignedIn)?;
        let response = ensure_success(builder.send().await?).await?;
        acknowledged_record(response, channel_id).await.map(|_| ())
    }

    async fn fetch_channels(&self) -> Result<Vec<ChannelSummary>, FetchError> {
        let records = self.get_records("/channels", &[]).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record) {
                Ok(channel) => Some(channel),
                Err(err) => {
                    warn!("skipping malformed channel record: {err}");
                    None
                }
            })
            .collect())
    }

    async fn fetch_users(&self) -> Result<Vec<UserProfile>, FetchError> {
        let records = self.get_records("/users", &[]).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record) {
                Ok(user) => Some(user),
                Err(err) => {
                    warn!("skipping malformed user record: {err}");
                    None
                }
            })
            .collect())
    }
}

async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_body(status.as_u16(), &body))
}

/// Reads the status wrapper of a mutating call. A wrapper carrying an error
/// code is a rejection even under HTTP 200; a record in `data` (or the body
/// itself) is returned as the stored message.
async fn acknowledged_record(
    response: Response,
    channel_id: &ChannelId,
) -> Result<Option<EventEnvelope>, SendError> {
    let status = response.status().as_u16();
    let body = response.text().await?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return Ok(None);
    };

    let wrapper: ApiResponse = serde_json::from_value(value.clone()).unwrap_or_default();
    if let Some(code) = wrapper.code.filter(|code| *code >= 400) {
        let message = wrapper
            .message
            .or(wrapper.status)
            .unwrap_or_else(|| format!("request failed with code {code}"));
        return Err(ApiError::new(code, message).into());
    }

    let record = match wrapper.data {
        Some(data @ Value::Object(_)) => Some(data),
        _ if value.get("id").is_some() => Some(value),
        _ => None,
    };
    debug!(status, has_record = record.is_some(), "mutation acknowledged");
    Ok(record.and_then(|record| message_record(record, channel_id)))
}

fn message_record(record: Value, channel_id: &ChannelId) -> Option<EventEnvelope> {
    match EventEnvelope::from_value(record) {
        Ok(mut envelope) => {
            envelope.channel_id.get_or_insert_with(|| channel_id.clone());
            Some(envelope)
        }
        Err(err) => {
            warn!(channel_id = %channel_id, "skipping malformed message record: {err}");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
