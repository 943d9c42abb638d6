use std::{
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use shared::{EventEnvelope, Topic};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::connection::ConnectionStatus;

pub trait EnvelopeHandler: Send + Sync {
    fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

impl<F> EnvelopeHandler for F
where
    F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        self(envelope)
    }
}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl HandlerId {
    pub fn next() -> Self {
        HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub topic: Topic,
    pub handler_id: HandlerId,
}

type SharedHandler = Arc<dyn EnvelopeHandler>;

pub struct SubscriptionRegistry {
    status: watch::Receiver<ConnectionStatus>,
    topics: Mutex<HashMap<Topic, Vec<(HandlerId, SharedHandler)>>>,
}

impl SubscriptionRegistry {
    pub fn new(status: watch::Receiver<ConnectionStatus>) -> Self {
        Self {
            status,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `None` unless the connection is currently `Connected`; callers
    /// subscribe again once a state listener reports `Connected`.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler_id: HandlerId,
        handler: impl EnvelopeHandler + 'static,
    ) -> Option<SubscriptionHandle> {
        if !self.status.borrow().is_connected() {
            debug!(%topic, handler_id = handler_id.0, "subscribe skipped; push connection not ready");
            return None;
        }

        let handler: SharedHandler = Arc::new(handler);
        let mut topics = self.lock_topics();
        let handlers = topics.entry(topic.clone()).or_default();
        match handlers.iter_mut().find(|(id, _)| *id == handler_id) {
            Some(slot) => slot.1 = handler,
            None => handlers.push((handler_id, handler)),
        }
        debug!(%topic, handler_id = handler_id.0, "subscribed");
        Some(SubscriptionHandle { topic, handler_id })
    }

    pub fn unsubscribe(&self, topic: &Topic, handler_id: HandlerId) -> bool {
        let mut topics = self.lock_topics();
        let Some(handlers) = topics.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != handler_id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    pub fn unsubscribe_all(&self, handler_id: HandlerId) -> usize {
        let mut topics = self.lock_topics();
        let mut removed = 0;
        topics.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(id, _)| *id != handler_id);
            removed += before - handlers.len();
            !handlers.is_empty()
        });
        removed
    }

    pub fn clear(&self) {
        self.lock_topics().clear();
    }

    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.lock_topics().get(topic).map_or(0, Vec::len)
    }

    /// `channel:{id}` when the envelope names a channel; `user:{sender}` and
    /// `user:{recipient}` when it is addressed to a recipient.
    pub fn topics_for(envelope: &EventEnvelope) -> Vec<Topic> {
        let mut topics = Vec::with_capacity(3);
        if let Some(channel_id) = &envelope.channel_id {
            topics.push(Topic::Channel(channel_id.clone()));
        }
        if let Some(recipient_id) = &envelope.recipient_id {
            if let Some(sender_id) = &envelope.sender_id {
                topics.push(Topic::User(sender_id.clone()));
            }
            let recipient = Topic::User(recipient_id.clone());
            if !topics.contains(&recipient) {
                topics.push(recipient);
            }
        }
        topics
    }

    pub fn dispatch(&self, envelope: &EventEnvelope) -> usize {
        let targets = self.matching_handlers(envelope);
        if targets.is_empty() {
            debug!(message_id = %envelope.message_id, "no subscriber for push envelope");
            return 0;
        }

        let mut delivered = 0;
        for (handler_id, handler) in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => warn!(
                    handler_id = handler_id.0,
                    message_id = %envelope.message_id,
                    "envelope handler failed: {err:#}"
                ),
                Err(_) => warn!(
                    handler_id = handler_id.0,
                    message_id = %envelope.message_id,
                    "envelope handler panicked"
                ),
            }
        }
        delivered
    }

    fn matching_handlers(&self, envelope: &EventEnvelope) -> Vec<(HandlerId, SharedHandler)> {
        let topics = self.lock_topics();
        let mut seen = HashSet::new();
        Self::topics_for(envelope)
            .iter()
            .filter_map(|topic| topics.get(topic))
            .flatten()
            .filter(|(id, _)| seen.insert(*id))
            .map(|(id, handler)| (*id, Arc::clone(handler)))
            .collect()
    }

    fn lock_topics(&self) -> MutexGuard<'_, HashMap<Topic, Vec<(HandlerId, SharedHandler)>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn spawn_dispatch_loop(
    registry: Arc<SubscriptionRegistry>,
    mut inbound: mpsc::UnboundedReceiver<EventEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            registry.dispatch(&envelope);
        }
        debug!("push dispatch loop finished");
    })
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
