use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use shared::{
    protocol::{ChannelSummary, EditMessageRequest, SendMessageRequest},
    Attachment, ChannelId, EnvelopeKind, EventEnvelope, MessageId, Reaction, UserId,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::{numeric_message_id, FileUpload, HttpMessagingApi, MessagingApi, TokenSource},
    config::ClientSettings,
    connection::{BackoffPolicy, ConnectionManager, ConnectionStatus, StateListenerId},
    conversation::{Conversation, ConversationKey},
    error::{ClientError, FetchError, SendError},
    reconcile::{Message, UserDirectory},
    registry::{spawn_dispatch_loop, HandlerId, SubscriptionRegistry},
    transport::{PushConnector, WebSocketConnector},
};

const EVENT_BUFFER: usize = 256;
const LOCAL_FILE_PREFIX: &str = "local-file://";

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessagesChanged(ConversationKey),
    ConnectionChanged(ConnectionStatus),
    Notice(String),
}

struct SessionState {
    active: Option<Conversation>,
    request_generation: u64,
    directory: Arc<UserDirectory>,
}

struct SessionShared {
    user_id: UserId,
    handler_id: HandlerId,
    registry: Arc<SubscriptionRegistry>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, text: String) {
        self.notify(SessionEvent::Notice(text));
    }

    fn subscribe_active(self: &Arc<Self>) -> usize {
        let topics = match self.lock_state().active.as_ref() {
            Some(conversation) => conversation.key().topics(),
            None => return 0,
        };
        let mut subscribed = 0;
        for topic in topics {
            let shared = Arc::downgrade(self);
            let handler = move |envelope: &EventEnvelope| -> anyhow::Result<()> {
                if let Some(shared) = shared.upgrade() {
                    shared.on_envelope(envelope);
                }
                Ok(())
            };
            if self
                .registry
                .subscribe(topic, self.handler_id, handler)
                .is_some()
            {
                subscribed += 1;
            }
        }
        subscribed
    }

    fn unsubscribe_key(&self, key: &ConversationKey) {
        for topic in key.topics() {
            self.registry.unsubscribe(&topic, self.handler_id);
        }
    }

    fn on_envelope(&self, envelope: &EventEnvelope) {
        let changed = {
            let mut state = self.lock_state();
            match state.active.as_mut() {
                Some(conversation) => conversation
                    .apply(envelope)
                    .then(|| conversation.key().clone()),
                None => None,
            }
        };
        if let Some(key) = changed {
            self.notify(SessionEvent::MessagesChanged(key));
        }
    }

    fn update_conversation(
        &self,
        key: &ConversationKey,
        apply: impl FnOnce(&mut Conversation) -> bool,
    ) -> bool {
        let changed = {
            let mut state = self.lock_state();
            state
                .active
                .as_mut()
                .filter(|conversation| conversation.key() == key)
                .map(apply)
                .unwrap_or(false)
        };
        if changed {
            self.notify(SessionEvent::MessagesChanged(key.clone()));
        }
        changed
    }
}

pub struct ConversationSession {
    shared: Arc<SessionShared>,
    api: Arc<dyn MessagingApi>,
    connection: Arc<ConnectionManager>,
    fetch_limit: u32,
    listener_id: StateListenerId,
    dispatch_task: JoinHandle<()>,
}

impl ConversationSession {
    /// Must be called inside a Tokio runtime; the dispatch loop is spawned here.
    pub fn new(
        user_id: UserId,
        api: Arc<dyn MessagingApi>,
        connector: Arc<dyn PushConnector>,
        policy: BackoffPolicy,
        fetch_limit: u32,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(connector, policy, inbound_tx);
        let registry = Arc::new(SubscriptionRegistry::new(connection.watch_status()));
        let dispatch_task = spawn_dispatch_loop(Arc::clone(&registry), inbound_rx);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let shared = Arc::new(SessionShared {
            user_id,
            handler_id: HandlerId::next(),
            registry,
            state: Mutex::new(SessionState {
                active: None,
                request_generation: 0,
                directory: Arc::new(UserDirectory::default()),
            }),
            events,
        });

        let listener = Arc::downgrade(&shared);
        let listener_id = connection.on_state_change(move |status| {
            let Some(shared) = listener.upgrade() else {
                return;
            };
            shared.notify(SessionEvent::ConnectionChanged(*status));
            if status.is_connected() {
                let topics = shared.subscribe_active();
                debug!(topics, "active conversation subscribed after connect");
            }
        });

        Self {
            shared,
            api,
            connection,
            fetch_limit,
            listener_id,
            dispatch_task,
        }
    }

    pub fn from_settings(
        user_id: UserId,
        tokens: Arc<dyn TokenSource>,
        settings: &ClientSettings,
    ) -> Result<Self, ClientError> {
        let endpoint = settings.push_endpoint()?;
        let connector = Arc::new(WebSocketConnector::new(endpoint, tokens.bearer_token()));
        let api = Arc::new(HttpMessagingApi::new(settings.api_base(), tokens));
        Ok(Self::new(
            user_id,
            api,
            connector,
            settings.backoff_policy(),
            settings.fetch_limit,
        ))
    }

    pub fn user_id(&self) -> &UserId {
        &self.shared.user_id
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.shared.registry
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn active_conversation(&self) -> Option<ConversationKey> {
        self.shared
            .lock_state()
            .active
            .as_ref()
            .map(|conversation| conversation.key().clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared
            .lock_state()
            .active
            .as_ref()
            .map(|conversation| conversation.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn directory(&self) -> Arc<UserDirectory> {
        Arc::clone(&self.shared.lock_state().directory)
    }

    pub async fn sign_in(&self) {
        info!(user_id = %self.shared.user_id, "session signing in");
        self.connection.connect();
        if let Err(err) = self.refresh_directory().await {
            warn!("user directory unavailable: {err}");
            self.shared.notice(format!("Could not load users: {err}"));
        }
    }

    pub fn sign_out(&self) {
        let previous = {
            let mut state = self.shared.lock_state();
            state.request_generation += 1;
            state
                .active
                .take()
                .map(|conversation| conversation.key().clone())
        };
        self.shared.registry.clear();
        self.connection.disconnect();
        info!(user_id = %self.shared.user_id, "session signed out");
        if let Some(key) = previous {
            self.shared.notify(SessionEvent::MessagesChanged(key));
        }
    }

    pub async fn refresh_directory(&self) -> Result<usize, FetchError> {
        let users = self.api.fetch_users().await?;
        let directory = Arc::new(UserDirectory::new(users));
        let count = directory.len();
        let mut state = self.shared.lock_state();
        if let Some(conversation) = state.active.as_mut() {
            conversation.set_directory(Arc::clone(&directory));
        }
        state.directory = directory;
        Ok(count)
    }

    pub async fn fetch_channels(&self) -> Result<Vec<ChannelSummary>, FetchError> {
        self.api.fetch_channels().await
    }

    /// Switches the view to `key`. The previous conversation's topics are
    /// released before the new ones are registered, and only the most recent
    /// call may install its fetch result. On failure the conversation stays
    /// empty and the error is returned.
    pub async fn open_conversation(&self, key: ConversationKey) -> Result<(), FetchError> {
        let (generation, previous) = {
            let mut state = self.shared.lock_state();
            state.request_generation += 1;
            let conversation = Conversation::new(key.clone(), Arc::clone(&state.directory));
            let previous = state
                .active
                .replace(conversation)
                .map(|conversation| conversation.key().clone());
            (state.request_generation, previous)
        };
        if let Some(previous) = previous {
            self.shared.unsubscribe_key(&previous);
        }
        let topics = self.shared.subscribe_active();
        debug!(conversation = %key, topics, "conversation opened");
        self.shared
            .notify(SessionEvent::MessagesChanged(key.clone()));

        let fetched = self.fetch_history(&key).await;
        self.install_baseline(generation, &key, fetched)
    }

    pub async fn reload(&self) -> Result<(), FetchError> {
        let (generation, key) = {
            let mut state = self.shared.lock_state();
            let Some(key) = state.active.as_mut().map(|conversation| {
                conversation.begin_fetch();
                conversation.key().clone()
            }) else {
                return Ok(());
            };
            state.request_generation += 1;
            (state.request_generation, key)
        };
        let fetched = self.fetch_history(&key).await;
        self.install_baseline(generation, &key, fetched)
    }

    pub async fn send_text(
        &self,
        content: &str,
        thread_parent_id: Option<MessageId>,
    ) -> Result<MessageId, SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyContent);
        }
        let (key, temp_id) = self.push_optimistic(content, None, thread_parent_id.clone())?;

        let outcome = match &key {
            ConversationKey::Channel(channel_id) => {
                let request = SendMessageRequest {
                    content: content.to_string(),
                    recipient_id: None,
                    thread_parent_id: thread_parent_id
                        .as_ref()
                        .and_then(|id| numeric_message_id(id.as_str())),
                };
                self.api.send_message(channel_id, &request).await
            }
            ConversationKey::Direct { recipient_id, .. } => self
                .publish_direct(&temp_id, recipient_id, content, thread_parent_id)
                .map(|()| None),
        };
        let refetch = !self.connection.status().is_connected();
        self.settle_send(&key, temp_id, outcome, refetch).await
    }

    pub async fn send_file(&self, upload: FileUpload) -> Result<MessageId, SendError> {
        let channel_id = match self.active_conversation() {
            Some(ConversationKey::Channel(channel_id)) => channel_id,
            Some(ConversationKey::Direct { .. }) => {
                return Err(SendError::Unsupported(
                    "file messages need a group channel".into(),
                ))
            }
            None => return Err(SendError::NoConversation),
        };
        let attachment = Attachment {
            url: format!("{LOCAL_FILE_PREFIX}{}", upload.file_name),
            mime_type: upload.mime_type.clone(),
        };
        let thread_parent_id = upload
            .thread_parent_id
            .map(|id| MessageId(id.to_string()));
        let (key, temp_id) =
            self.push_optimistic(&upload.content, Some(attachment), thread_parent_id)?;

        let outcome = self.api.send_file(&channel_id, &upload).await;
        self.settle_send(&key, temp_id, outcome, true).await
    }

    pub async fn edit_message(&self, id: &MessageId, content: &str) -> Result<(), SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyContent);
        }
        let (key, channel_id, numeric_id) = self.remote_target(id)?;
        let request = EditMessageRequest {
            channel_id: channel_id.as_str().parse().ok(),
            recipient_id: None,
            content: content.to_string(),
        };
        if let Err(err) = self
            .api
            .edit_message(&channel_id, numeric_id, &request)
            .await
        {
            warn!(message_id = %id, "edit rejected: {err}");
            self.shared.notice(format!("Failed to update message: {err}"));
            return Err(err);
        }
        self.shared
            .update_conversation(&key, |conversation| conversation.apply_local_edit(id, content));
        Ok(())
    }

    pub async fn delete_message(&self, id: &MessageId) -> Result<(), SendError> {
        let (key, local_only) = {
            let state = self.shared.lock_state();
            let conversation = state.active.as_ref().ok_or(SendError::NoConversation)?;
            let message = conversation
                .get(id)
                .ok_or_else(|| SendError::UnknownMessage(id.to_string()))?;
            (conversation.key().clone(), message.is_optimistic())
        };
        if local_only {
            self.shared
                .update_conversation(&key, |conversation| conversation.retract(id));
            return Ok(());
        }

        let (key, channel_id, numeric_id) = self.remote_target(id)?;
        if let Err(err) = self.api.delete_message(&channel_id, numeric_id).await {
            warn!(message_id = %id, "delete rejected: {err}");
            self.shared.notice(format!("Failed to delete message: {err}"));
            return Err(err);
        }
        self.shared
            .update_conversation(&key, |conversation| conversation.apply_local_delete(id));
        Ok(())
    }

    pub fn react(&self, id: &MessageId, reaction_type: &str) -> Result<(), SendError> {
        let (key, mut reactions) = {
            let state = self.shared.lock_state();
            let conversation = state.active.as_ref().ok_or(SendError::NoConversation)?;
            let message = conversation
                .get(id)
                .ok_or_else(|| SendError::UnknownMessage(id.to_string()))?;
            (conversation.key().clone(), message.reactions.clone())
        };
        let user_id = &self.shared.user_id;
        let before = reactions.len();
        reactions.retain(|reaction| {
            !(&reaction.reactor_id == user_id && reaction.reaction_type == reaction_type)
        });
        if reactions.len() == before {
            reactions.push(Reaction {
                reactor_id: user_id.clone(),
                reaction_type: reaction_type.to_string(),
                created_at: Some(chrono::Utc::now()),
            });
        }
        self.shared
            .update_conversation(&key, |conversation| conversation.set_reactions(id, reactions));
        Ok(())
    }

    async fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<EventEnvelope>, FetchError> {
        match key {
            ConversationKey::Channel(channel_id) => {
                self.api.fetch_messages(channel_id, self.fetch_limit).await
            }
            // No history endpoint for direct pairs; they fill from push only.
            ConversationKey::Direct { .. } => Ok(Vec::new()),
        }
    }

    fn install_baseline(
        &self,
        generation: u64,
        key: &ConversationKey,
        fetched: Result<Vec<EventEnvelope>, FetchError>,
    ) -> Result<(), FetchError> {
        let installed = {
            let mut state = self.shared.lock_state();
            if state.request_generation != generation {
                debug!(conversation = %key, "discarding stale conversation fetch");
                return Ok(());
            }
            let directory = Arc::clone(&state.directory);
            let baseline = match &fetched {
                Ok(envelopes) => envelopes
                    .iter()
                    .filter_map(|envelope| Message::from_envelope(envelope, &directory))
                    .collect(),
                Err(_) => Vec::new(),
            };
            if let Some(conversation) = state
                .active
                .as_mut()
                .filter(|conversation| conversation.key() == key)
            {
                conversation.replace_with_fetched(baseline);
            }
            fetched.map(|envelopes| envelopes.len())
        };

        match installed {
            Ok(count) => {
                debug!(conversation = %key, count, "conversation history installed");
                self.shared
                    .notify(SessionEvent::MessagesChanged(key.clone()));
                Ok(())
            }
            Err(err) => {
                warn!(conversation = %key, "conversation fetch failed: {err}");
                self.shared
                    .notify(SessionEvent::MessagesChanged(key.clone()));
                self.shared.notice(format!("Failed to fetch messages: {err}"));
                Err(err)
            }
        }
    }

    fn push_optimistic(
        &self,
        content: &str,
        attachment: Option<Attachment>,
        thread_parent_id: Option<MessageId>,
    ) -> Result<(ConversationKey, MessageId), SendError> {
        let (key, temp_id) = {
            let mut state = self.shared.lock_state();
            let conversation = state.active.as_mut().ok_or(SendError::NoConversation)?;
            let temp_id = conversation.push_optimistic(
                &self.shared.user_id,
                content,
                attachment,
                thread_parent_id,
            );
            (conversation.key().clone(), temp_id)
        };
        self.shared
            .notify(SessionEvent::MessagesChanged(key.clone()));
        Ok((key, temp_id))
    }

    fn publish_direct(
        &self,
        temp_id: &MessageId,
        recipient_id: &UserId,
        content: &str,
        thread_parent_id: Option<MessageId>,
    ) -> Result<(), SendError> {
        let mut envelope = EventEnvelope::delete(temp_id.clone());
        envelope.kind = EnvelopeKind::Create;
        envelope.recipient_id = Some(recipient_id.clone());
        envelope.sender_id = Some(self.shared.user_id.clone());
        envelope.content = content.to_string();
        envelope.timestamp = Some(chrono::Utc::now());
        envelope.thread_parent_id = thread_parent_id;
        self.connection.publish(&envelope)?;
        Ok(())
    }

    async fn settle_send(
        &self,
        key: &ConversationKey,
        temp_id: MessageId,
        outcome: Result<Option<EventEnvelope>, SendError>,
        refetch_if_unechoed: bool,
    ) -> Result<MessageId, SendError> {
        match outcome {
            Ok(record) => {
                let directory = self.directory();
                let confirmed = record
                    .as_ref()
                    .and_then(|envelope| Message::from_envelope(envelope, &directory));
                let settled_id = confirmed
                    .as_ref()
                    .map_or_else(|| temp_id.clone(), |message| message.id.clone());
                let echoed = confirmed.is_some();
                self.shared.update_conversation(key, |conversation| {
                    conversation.confirm_send(&temp_id, confirmed)
                });

                if !echoed && refetch_if_unechoed && key.channel_id().is_some() {
                    if let Err(err) = self.reload().await {
                        debug!("post-send refresh failed: {err}");
                    }
                }
                Ok(settled_id)
            }
            Err(err) => {
                warn!(conversation = %key, temp_id = %temp_id, "send failed: {err}");
                self.shared.update_conversation(key, |conversation| {
                    conversation.mark_failed(&temp_id, err.to_string())
                });
                self.shared.notice(format!("Failed to send message: {err}"));
                Err(err.with_temp_id(temp_id.as_str()))
            }
        }
    }

    fn remote_target(&self, id: &MessageId) -> Result<(ConversationKey, ChannelId, i64), SendError> {
        let state = self.shared.lock_state();
        let conversation = state.active.as_ref().ok_or(SendError::NoConversation)?;
        if conversation.get(id).is_none() {
            return Err(SendError::UnknownMessage(id.to_string()));
        }
        let channel_id = conversation.key().channel_id().cloned().ok_or_else(|| {
            SendError::Unsupported("direct messages cannot be edited or deleted".into())
        })?;
        let numeric_id = numeric_message_id(id.as_str()).ok_or_else(|| {
            SendError::Unsupported(format!("message {id} has no server id yet"))
        })?;
        Ok((conversation.key().clone(), channel_id, numeric_id))
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.connection.remove_state_listener(self.listener_id);
        self.connection.disconnect();
        self.dispatch_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
