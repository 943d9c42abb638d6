//! State machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//! Connecting --err--> Error --(delay)--> Connecting     while retries remain
//! Connected --closed--> Error --(delay)--> Connecting
//! Error (retries exhausted) stays put until the next connect()
//! any --disconnect()--> Disconnected
//! ```

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::EventEnvelope;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::TransportError,
    transport::{PushConnector, PushStream},
};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_RETRY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before the reconnect that follows a failure observed at
    /// `retry_count`, or `None` once the retry budget is spent.
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries {
            return None;
        }
        let factor = 2u32.checked_pow(retry_count)?;
        self.base_delay.checked_mul(factor)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_RETRY_DELAY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub next_retry: Option<Duration>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == ConnectionState::Error && self.next_retry.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateListenerId(u64);

type StateListener = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

struct ConnectionInner {
    status: ConnectionStatus,
    generation: u64,
    driver: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    listeners: Vec<(StateListenerId, StateListener)>,
    next_listener_id: u64,
}

enum PumpExit {
    Released,
    ClosedByPeer,
    Failed(TransportError),
}

enum PumpEvent {
    Inbound(Option<Result<String, TransportError>>),
    Outbound(Option<String>),
}

pub struct ConnectionManager {
    connector: Arc<dyn PushConnector>,
    policy: BackoffPolicy,
    inbound: mpsc::UnboundedSender<EventEnvelope>,
    status_tx: watch::Sender<ConnectionStatus>,
    inner: Mutex<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        policy: BackoffPolicy,
        inbound: mpsc::UnboundedSender<EventEnvelope>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Arc::new(Self {
            connector,
            policy,
            inbound,
            status_tx,
            inner: Mutex::new(ConnectionInner {
                status: ConnectionStatus::default(),
                generation: 0,
                driver: None,
                outbound: None,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
        })
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock_inner().status
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn on_state_change(
        &self,
        listener: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> StateListenerId {
        let mut inner = self.lock_inner();
        inner.next_listener_id += 1;
        let id = StateListenerId(inner.next_listener_id);
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_state_listener(&self, id: StateListenerId) -> bool {
        let mut inner = self.lock_inner();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        inner.listeners.len() != before
    }

    /// No-op while `Connecting` or `Connected`. From `Disconnected` or `Error`
    /// (including while a reconnect is pending) it resets the retry budget and
    /// connects immediately.
    pub fn connect(self: &Arc<Self>) {
        let (generation, status, listeners) = {
            let mut inner = self.lock_inner();
            match inner.status.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!(state = ?inner.status.state, "push connect ignored; already active");
                    return;
                }
                ConnectionState::Disconnected | ConnectionState::Error => {}
            }
            if let Some(driver) = inner.driver.take() {
                driver.abort();
            }
            inner.outbound = None;
            inner.generation += 1;
            inner.status = ConnectionStatus {
                state: ConnectionState::Connecting,
                retry_count: 0,
                next_retry: None,
            };
            self.status_tx.send_replace(inner.status);
            (inner.generation, inner.status, listener_snapshot(&inner))
        };
        notify(status, &listeners);

        let mut inner = self.lock_inner();
        if inner.generation != generation {
            return;
        }
        let manager = Arc::clone(self);
        inner.driver = Some(tokio::spawn(async move {
            manager.drive(generation).await;
        }));
    }

    pub fn disconnect(&self) {
        let (status, listeners) = {
            let mut inner = self.lock_inner();
            inner.generation += 1;
            let released = inner.outbound.take().is_some();
            if let Some(driver) = inner.driver.take() {
                // A live pump closes the stream itself once its outbound side
                // is dropped; anything else is a pending dial or timer.
                if !released {
                    driver.abort();
                }
            }
            if inner.status.state == ConnectionState::Disconnected {
                return;
            }
            inner.status = ConnectionStatus::default();
            self.status_tx.send_replace(inner.status);
            (inner.status, listener_snapshot(&inner))
        };
        info!("push connection closed by client");
        notify(status, &listeners);
    }

    pub fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        let frame = envelope
            .to_frame()
            .map_err(|err| TransportError::Write(err.to_string()))?;
        let inner = self.lock_inner();
        match (&inner.status.state, &inner.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound
                .send(frame)
                .map_err(|_| TransportError::NotConnected),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn drive(self: Arc<Self>, generation: u64) {
        loop {
            match self.connector.connect().await {
                Ok(mut stream) => {
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    let connected = self.transition(generation, Some(outbound_tx), |status| {
                        status.state = ConnectionState::Connected;
                        status.retry_count = 0;
                        status.next_retry = None;
                    });
                    if connected.is_none() {
                        stream.close().await;
                        return;
                    }
                    info!("push connection established");

                    match self.pump(&mut stream, outbound_rx).await {
                        PumpExit::Released => {
                            stream.close().await;
                            return;
                        }
                        PumpExit::ClosedByPeer => warn!("push connection closed unexpectedly"),
                        PumpExit::Failed(err) => warn!("push connection lost: {err}"),
                    }
                }
                Err(err) => {
                    warn!(retry_count = self.status().retry_count, "push connect failed: {err}")
                }
            }

            let policy = self.policy;
            let scheduled = self.transition(generation, None, |status| {
                let delay = policy.delay_for(status.retry_count);
                status.state = ConnectionState::Error;
                status.next_retry = delay;
                if delay.is_some() {
                    status.retry_count += 1;
                }
                (delay, status.retry_count)
            });
            let Some((delay, retry_count)) = scheduled else {
                return;
            };
            let Some(delay) = delay else {
                error!(
                    retry_count,
                    "push reconnect attempts exhausted; waiting for explicit connect"
                );
                return;
            };

            info!(
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "scheduling push reconnect"
            );
            tokio::time::sleep(delay).await;

            let resumed = self.transition(generation, None, |status| {
                status.state = ConnectionState::Connecting;
                status.next_retry = None;
            });
            if resumed.is_none() {
                return;
            }
        }
    }

    async fn pump(
        &self,
        stream: &mut Box<dyn PushStream>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ) -> PumpExit {
        loop {
            let event = tokio::select! {
                frame = stream.next_frame() => PumpEvent::Inbound(frame),
                outbound = outbound_rx.recv() => PumpEvent::Outbound(outbound),
            };
            match event {
                PumpEvent::Inbound(Some(Ok(text))) => self.handle_frame(&text),
                PumpEvent::Inbound(Some(Err(err))) => return PumpExit::Failed(err),
                PumpEvent::Inbound(None) => return PumpExit::ClosedByPeer,
                PumpEvent::Outbound(Some(frame)) => {
                    if let Err(err) = stream.send_frame(frame).await {
                        return PumpExit::Failed(err);
                    }
                }
                PumpEvent::Outbound(None) => return PumpExit::Released,
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match EventEnvelope::from_frame(text) {
            Ok(envelope) => {
                debug!(
                    kind = ?envelope.kind,
                    message_id = %envelope.message_id,
                    "push envelope received"
                );
                if self.inbound.send(envelope).is_err() {
                    debug!("push envelope dropped; no dispatcher attached");
                }
            }
            Err(err) => warn!(frame_len = text.len(), "dropping malformed push frame: {err}"),
        }
    }

    fn transition<R>(
        &self,
        generation: u64,
        outbound: Option<mpsc::UnboundedSender<String>>,
        apply: impl FnOnce(&mut ConnectionStatus) -> R,
    ) -> Option<R> {
        let (result, status, listeners) = {
            let mut inner = self.lock_inner();
            if inner.generation != generation {
                return None;
            }
            let result = apply(&mut inner.status);
            inner.outbound = outbound;
            self.status_tx.send_replace(inner.status);
            (result, inner.status, listener_snapshot(&inner))
        };
        notify(status, &listeners);
        Some(result)
    }

    fn lock_inner(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn notify(status: ConnectionStatus, listeners: &[StateListener]) {
    for listener in listeners {
        listener(&status);
    }
}

fn listener_snapshot(inner: &ConnectionInner) -> Vec<StateListener> {
    inner
        .listeners
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect()
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
