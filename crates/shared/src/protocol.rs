use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    deserialize_optional_id_string, ChannelId, ChannelKind, MessageId, UserId,
};

pub const DEFAULT_ATTACHMENT_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvelopeKind {
    Create,
    Update,
    Delete,
}

impl EnvelopeKind {
    fn parse(raw: Option<&str>) -> Result<Self, ParseError> {
        let Some(raw) = raw else {
            return Ok(EnvelopeKind::Create);
        };
        match raw.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Ok(EnvelopeKind::Create),
            "UPDATE" => Ok(EnvelopeKind::Update),
            "DELETE" => Ok(EnvelopeKind::Delete),
            _ => Err(ParseError::UnsupportedKind(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime_type: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub reactor_id: UserId,
    pub reaction_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// One push-delivered message event.
///
/// `sender_id` is always present for `Create` and `Update`; a `Delete` only
/// guarantees `message_id` plus whatever routing context the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub kind: EnvelopeKind,
    pub message_id: MessageId,
    pub channel_id: Option<ChannelId>,
    pub recipient_id: Option<UserId>,
    pub sender_id: Option<UserId>,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub timestamp: Option<DateTime<Utc>>,
    pub thread_parent_id: Option<MessageId>,
    pub reactions: Vec<Reaction>,
    pub sender_name: Option<String>,
    pub sender_avatar: Option<String>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported event type '{0}'")]
    UnsupportedKind(String),
    #[error("frame has no message id")]
    MissingMessageId,
    #[error("{0:?} frame has no sender_id")]
    MissingSender(EnvelopeKind),
}

#[derive(Debug, Deserialize)]
struct WireReaction {
    #[serde(alias = "user_id", deserialize_with = "crate::domain::deserialize_id_string")]
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "reactionType", alias = "reaction_type")]
    reaction_type: String,
    #[serde(rename = "createdAt", alias = "created_at", default)]
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id_string")]
    id: Option<String>,
    #[serde(
        rename = "messageId",
        alias = "message_id",
        default,
        deserialize_with = "deserialize_optional_id_string"
    )]
    message_id: Option<String>,
    #[serde(
        alias = "channelId",
        default,
        deserialize_with = "deserialize_optional_id_string"
    )]
    channel_id: Option<String>,
    #[serde(
        alias = "recipientId",
        default,
        deserialize_with = "deserialize_optional_id_string"
    )]
    recipient_id: Option<String>,
    #[serde(
        alias = "senderId",
        default,
        deserialize_with = "deserialize_optional_id_string"
    )]
    sender_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(alias = "fileUrl", default)]
    file_url: Option<String>,
    #[serde(alias = "fileType", default)]
    file_type: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(
        alias = "threadParentId",
        default,
        deserialize_with = "deserialize_optional_id_string"
    )]
    thread_parent_id: Option<String>,
    #[serde(default)]
    reactions: Option<Vec<WireReaction>>,
    #[serde(default)]
    sender_name: Option<String>,
    #[serde(default)]
    sender_avatar: Option<String>,
}

impl EventEnvelope {
    pub fn from_frame(raw: &str) -> Result<Self, ParseError> {
        let frame: WireFrame = serde_json::from_str(raw)?;
        Self::from_wire(frame)
    }

    /// Decodes a message record returned by the REST collaborator. Records
    /// share the push frame layout but usually omit `type`.
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        let frame: WireFrame = serde_json::from_value(value)?;
        Self::from_wire(frame)
    }

    fn from_wire(frame: WireFrame) -> Result<Self, ParseError> {
        let kind = EnvelopeKind::parse(frame.kind.as_deref())?;
        let message_id = frame
            .id
            .or(frame.message_id)
            .map(MessageId)
            .ok_or(ParseError::MissingMessageId)?;
        let sender_id = frame.sender_id.map(UserId);
        if sender_id.is_none() && kind != EnvelopeKind::Delete {
            return Err(ParseError::MissingSender(kind));
        }

        let attachment = frame.file_url.filter(|url| !url.is_empty()).map(|url| {
            Attachment {
                url,
                mime_type: frame
                    .file_type
                    .filter(|mime| !mime.is_empty())
                    .unwrap_or_else(|| DEFAULT_ATTACHMENT_MIME.to_string()),
            }
        });

        let reactions = frame
            .reactions
            .unwrap_or_default()
            .into_iter()
            .map(|reaction| Reaction {
                reactor_id: UserId(reaction.user_id),
                reaction_type: reaction.reaction_type,
                created_at: reaction.created_at.as_deref().and_then(parse_timestamp),
            })
            .collect();

        Ok(Self {
            kind,
            message_id,
            channel_id: frame.channel_id.map(ChannelId),
            recipient_id: frame.recipient_id.map(UserId),
            sender_id,
            content: frame.content.unwrap_or_default(),
            attachment,
            timestamp: frame.timestamp.as_deref().and_then(parse_timestamp),
            thread_parent_id: frame.thread_parent_id.map(MessageId),
            reactions,
            sender_name: frame.sender_name.filter(|name| !name.is_empty()),
            sender_avatar: frame.sender_avatar.filter(|avatar| !avatar.is_empty()),
        })
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let frame = OutboundFrame {
            kind: self.kind,
            id: &self.message_id,
            message_id: &self.message_id,
            channel_id: self.channel_id.as_ref(),
            recipient_id: self.recipient_id.as_ref(),
            sender_id: self.sender_id.as_ref(),
            content: (!self.content.is_empty() || self.kind != EnvelopeKind::Delete)
                .then_some(self.content.as_str()),
            file_url: self.attachment.as_ref().map(|a| a.url.as_str()),
            file_type: self.attachment.as_ref().map(|a| a.mime_type.as_str()),
            timestamp: self.timestamp.map(|ts| ts.to_rfc3339()),
            thread_parent_id: self.thread_parent_id.as_ref(),
            reactions: self
                .reactions
                .iter()
                .map(|reaction| OutboundReaction {
                    user_id: reaction.reactor_id.as_str(),
                    reaction_type: &reaction.reaction_type,
                    created_at: reaction.created_at.map(|ts| ts.to_rfc3339()),
                })
                .collect(),
        };
        serde_json::to_string(&frame)
    }

    pub fn delete(message_id: impl Into<MessageId>) -> Self {
        Self {
            kind: EnvelopeKind::Delete,
            message_id: message_id.into(),
            channel_id: None,
            recipient_id: None,
            sender_id: None,
            content: String::new(),
            attachment: None,
            timestamp: None,
            thread_parent_id: None,
            reactions: Vec::new(),
            sender_name: None,
            sender_avatar: None,
        }
    }
}

#[derive(Serialize)]
struct OutboundReaction<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
    #[serde(rename = "reactionType")]
    reaction_type: &'a str,
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    id: &'a MessageId,
    #[serde(rename = "messageId")]
    message_id: &'a MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_id: Option<&'a ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient_id: Option<&'a UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_id: Option<&'a UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_parent_id: Option<&'a MessageId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reactions: Vec<OutboundReaction<'a>>,
}

/// Accepts RFC 3339 or a zone-less `YYYY-MM-DDTHH:MM:SS[.f]`, read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default)]
    pub members: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub content: String,
    pub recipient_id: Option<i64>,
    pub thread_parent_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditMessageRequest {
    pub channel_id: Option<i64>,
    pub recipient_id: Option<i64>,
    pub content: String,
}

/// Status wrapper the gateway puts around mutating responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Pulls the record list out of the body shapes the list endpoints return:
/// a bare array or an object carrying `data`, `messages`, `channels` or `items`.
pub fn extract_record_list(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => ["data", "messages", "channels", "users", "items"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            }),
        _ => None,
    }
}
