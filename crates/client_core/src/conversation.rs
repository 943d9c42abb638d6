use std::{collections::HashSet, fmt, sync::Arc};

use chrono::Utc;
use shared::{
    Attachment, ChannelId, EnvelopeKind, EventEnvelope, MessageId, Reaction, Topic, UserId,
};
use tracing::debug;
use uuid::Uuid;

use crate::reconcile::{reconcile, Delivery, Message, UserDirectory};

pub const TEMP_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Channel(ChannelId),
    Direct { self_id: UserId, recipient_id: UserId },
}

impl ConversationKey {
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            ConversationKey::Channel(channel_id) => vec![Topic::Channel(channel_id.clone())],
            ConversationKey::Direct {
                self_id,
                recipient_id,
            } => vec![
                Topic::User(recipient_id.clone()),
                Topic::User(self_id.clone()),
            ],
        }
    }

    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            ConversationKey::Channel(channel_id) => Some(channel_id),
            ConversationKey::Direct { .. } => None,
        }
    }

    /// Whether `envelope` belongs here. The `user:{self}` topic also carries
    /// other direct conversations, so direct pairs are matched on both ends.
    /// Deletes are accepted as-is; unknown ids fall through as no-ops.
    pub fn accepts(&self, envelope: &EventEnvelope) -> bool {
        if envelope.kind == EnvelopeKind::Delete {
            return true;
        }
        match self {
            ConversationKey::Channel(channel_id) => {
                envelope.channel_id.as_ref() == Some(channel_id)
            }
            ConversationKey::Direct {
                self_id,
                recipient_id,
            } => {
                let (Some(sender), Some(recipient)) =
                    (envelope.sender_id.as_ref(), envelope.recipient_id.as_ref())
                else {
                    return false;
                };
                (sender == self_id && recipient == recipient_id)
                    || (sender == recipient_id && recipient == self_id)
            }
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Channel(channel_id) => write!(f, "channel:{channel_id}"),
            ConversationKey::Direct { recipient_id, .. } => write!(f, "direct:{recipient_id}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PushLog {
    touched: Vec<MessageId>,
    deleted: HashSet<MessageId>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    key: ConversationKey,
    directory: Arc<UserDirectory>,
    messages: Vec<Message>,
    pushed: PushLog,
}

impl Conversation {
    pub fn new(key: ConversationKey, directory: Arc<UserDirectory>) -> Self {
        Self {
            key,
            directory,
            messages: Vec::new(),
            pushed: PushLog::default(),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn set_directory(&mut self, directory: Arc<UserDirectory>) {
        self.directory = directory;
    }

    pub fn begin_fetch(&mut self) {
        self.pushed = PushLog::default();
    }

    /// Pushes seen since `begin_fetch` win over the fetched copies. Unconfirmed
    /// local messages stay at the end unless the baseline confirms them.
    pub fn replace_with_fetched(&mut self, fetched: Vec<Message>) {
        let pushed = std::mem::take(&mut self.pushed);
        let mut seen = HashSet::new();
        let mut baseline: Vec<Message> = fetched
            .into_iter()
            .filter(|message| !pushed.deleted.contains(&message.id))
            .filter(|message| seen.insert(message.id.clone()))
            .collect();

        let live: Vec<Message> = self
            .messages
            .iter()
            .filter(|message| !message.is_optimistic() && pushed.touched.contains(&message.id))
            .cloned()
            .collect();
        let replayed = live.len();
        for message in live {
            match baseline.iter_mut().find(|server| server.id == message.id) {
                Some(slot) => *slot = message,
                None => baseline.push(message),
            }
        }

        let mut confirmed_copies: Vec<&Message> = baseline.iter().collect();
        let mut carried = Vec::new();
        for local in self.messages.drain(..).filter(Message::is_optimistic) {
            match confirmed_copies
                .iter()
                .position(|server| local.is_pending_copy_of(server))
            {
                Some(index) => {
                    confirmed_copies.remove(index);
                }
                None => carried.push(local),
            }
        }
        debug!(
            conversation = %self.key,
            fetched = baseline.len(),
            replayed,
            carried = carried.len(),
            "conversation baseline replaced"
        );
        baseline.extend(carried);
        self.messages = baseline;
    }

    pub fn push_optimistic(
        &mut self,
        sender_id: &UserId,
        content: &str,
        attachment: Option<Attachment>,
        thread_parent_id: Option<MessageId>,
    ) -> MessageId {
        let id = MessageId(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()));
        let recipient_id = match &self.key {
            ConversationKey::Direct { recipient_id, .. } => Some(recipient_id.clone()),
            ConversationKey::Channel(_) => None,
        };
        self.messages.push(Message {
            id: id.clone(),
            channel_id: self.key.channel_id().cloned(),
            recipient_id,
            sender_id: sender_id.clone(),
            content: content.to_string(),
            attachment,
            timestamp: Utc::now(),
            thread_parent_id,
            reactions: Vec::new(),
            delivery: Delivery::Pending,
            display_name: self.directory.display_name(sender_id),
            avatar_url: self.directory.avatar_url(sender_id),
        });
        id
    }

    /// Settles a local send the server accepted. With the server copy in hand
    /// the temporary entry is replaced where it stands, or dropped if the push
    /// `Create` already delivered that copy. Without one the entry stays
    /// pending for the push channel or the next fetch to supersede.
    pub fn confirm_send(&mut self, temp_id: &MessageId, confirmed: Option<Message>) -> bool {
        let Some(index) = self.position(temp_id) else {
            return false;
        };
        let Some(mut confirmed) = confirmed else {
            return true;
        };
        if self.get(&confirmed.id).is_some() {
            self.messages.remove(index);
        } else {
            confirmed.delivery = Delivery::Confirmed;
            self.messages[index] = confirmed;
        }
        true
    }

    pub fn mark_failed(&mut self, temp_id: &MessageId, reason: impl Into<String>) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|message| &message.id == temp_id && message.is_optimistic())
        {
            Some(message) => {
                message.delivery = Delivery::Failed {
                    reason: reason.into(),
                };
                true
            }
            None => false,
        }
    }

    pub fn retract(&mut self, temp_id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages
            .retain(|message| !(&message.id == temp_id && message.is_optimistic()));
        self.messages.len() != before
    }

    pub fn apply(&mut self, envelope: &EventEnvelope) -> bool {
        if !self.key.accepts(envelope) {
            return false;
        }
        self.record_push(envelope);
        let next = reconcile(self.messages.clone(), envelope, &self.directory);
        let changed = next != self.messages;
        self.messages = next;
        changed
    }

    pub fn apply_local_edit(&mut self, id: &MessageId, content: &str) -> bool {
        match self.messages.iter_mut().find(|message| &message.id == id) {
            Some(message) => {
                message.content = content.to_string();
                true
            }
            None => false,
        }
    }

    pub fn apply_local_delete(&mut self, id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|message| &message.id != id);
        self.messages.len() != before
    }

    pub fn set_reactions(&mut self, id: &MessageId, reactions: Vec<Reaction>) -> bool {
        match self.messages.iter_mut().find(|message| &message.id == id) {
            Some(message) => {
                message.reactions = reactions;
                true
            }
            None => false,
        }
    }

    fn record_push(&mut self, envelope: &EventEnvelope) {
        let id = &envelope.message_id;
        match envelope.kind {
            EnvelopeKind::Delete => {
                self.pushed.deleted.insert(id.clone());
            }
            EnvelopeKind::Create | EnvelopeKind::Update => {
                if !self.pushed.touched.contains(id) {
                    self.pushed.touched.push(id.clone());
                }
            }
        }
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
