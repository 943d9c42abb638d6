use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    Attachment, ChannelId, EnvelopeKind, EventEnvelope, MessageId, Reaction, UserId, UserProfile,
};
use tracing::debug;

pub const UNKNOWN_USER_NAME: &str = "Unknown User";
pub const PLACEHOLDER_AVATAR: &str = "/placeholder.svg";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Delivery {
    #[default]
    Confirmed,
    Pending,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: Option<ChannelId>,
    pub recipient_id: Option<UserId>,
    pub sender_id: UserId,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub thread_parent_id: Option<MessageId>,
    pub reactions: Vec<Reaction>,
    pub delivery: Delivery,
    pub display_name: String,
    pub avatar_url: String,
}

impl Message {
    pub fn from_envelope(envelope: &EventEnvelope, directory: &UserDirectory) -> Option<Self> {
        let sender_id = envelope.sender_id.clone()?;
        let display_name = envelope
            .sender_name
            .clone()
            .unwrap_or_else(|| directory.display_name(&sender_id));
        let avatar_url = envelope
            .sender_avatar
            .clone()
            .unwrap_or_else(|| directory.avatar_url(&sender_id));
        Some(Self {
            id: envelope.message_id.clone(),
            channel_id: envelope.channel_id.clone(),
            recipient_id: envelope.recipient_id.clone(),
            sender_id,
            content: envelope.content.clone(),
            attachment: envelope.attachment.clone(),
            timestamp: envelope.timestamp.unwrap_or_else(Utc::now),
            thread_parent_id: envelope.thread_parent_id.clone(),
            reactions: envelope.reactions.clone(),
            delivery: Delivery::Confirmed,
            display_name,
            avatar_url,
        })
    }

    pub fn is_optimistic(&self) -> bool {
        self.delivery != Delivery::Confirmed
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == Delivery::Pending
    }

    pub(crate) fn is_pending_copy_of(&self, other: &Message) -> bool {
        self.is_pending() && self.sender_id == other.sender_id && self.content == other.content
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: HashMap<UserId, UserProfile>,
}

impl UserDirectory {
    pub fn new(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            users: profiles
                .into_iter()
                .map(|profile| (profile.id.clone(), profile))
                .collect(),
        }
    }

    pub fn insert(&mut self, profile: UserProfile) {
        self.users.insert(profile.id.clone(), profile);
    }

    pub fn get(&self, id: &UserId) -> Option<&UserProfile> {
        self.users.get(id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn display_name(&self, id: &UserId) -> String {
        self.get(id)
            .map(|profile| profile.name.trim())
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_USER_NAME)
            .to_string()
    }

    pub fn avatar_url(&self, id: &UserId) -> String {
        self.get(id)
            .and_then(|profile| profile.avatar.as_deref())
            .filter(|avatar| !avatar.is_empty())
            .unwrap_or(PLACEHOLDER_AVATAR)
            .to_string()
    }
}

/// Folds one envelope into `current` and returns the new sequence.
///
/// * `Create` is ignored when the id is already present; otherwise it is
///   appended and the first pending local copy (same sender and content) is
///   dropped.
/// * `Update` replaces the matching message where it stands.
/// * `Delete` removes the matching message; unknown ids are a no-op.
pub fn reconcile(
    mut current: Vec<Message>,
    envelope: &EventEnvelope,
    directory: &UserDirectory,
) -> Vec<Message> {
    match envelope.kind {
        EnvelopeKind::Create => {
            if current.iter().any(|message| message.id == envelope.message_id) {
                debug!(message_id = %envelope.message_id, "duplicate create ignored");
                return current;
            }
            let Some(confirmed) = Message::from_envelope(envelope, directory) else {
                return current;
            };
            if let Some(index) = current
                .iter()
                .position(|message| message.is_pending_copy_of(&confirmed))
            {
                let superseded = current.remove(index);
                debug!(
                    temp_id = %superseded.id,
                    message_id = %confirmed.id,
                    "optimistic message superseded by server copy"
                );
            }
            current.push(confirmed);
        }
        EnvelopeKind::Update => {
            let Some(slot) = current
                .iter_mut()
                .find(|message| message.id == envelope.message_id)
            else {
                debug!(message_id = %envelope.message_id, "update for unknown message ignored");
                return current;
            };
            if let Some(mut updated) = Message::from_envelope(envelope, directory) {
                if envelope.timestamp.is_none() {
                    updated.timestamp = slot.timestamp;
                }
                *slot = updated;
            }
        }
        EnvelopeKind::Delete => {
            current.retain(|message| message.id != envelope.message_id);
        }
    }
    current
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
