//! Lifecycle of the controller's single broker connection.
//!
//! A [`Session`] moves `Idle -> Connecting -> Connected`, or `Connecting ->
//! Failed` when the attempt errors or times out. [`Session::stop`] moves any
//! non-terminal state to `Closed` and may run before an attempt completes: the
//! attempt is cancelled, and a connection it already obtained is released
//! instead of being committed.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use broker_integration::{
    BrokerConnectOptions, BrokerConnection, BrokerConnector, BrokerEvent, DEFAULT_KEEP_ALIVE,
};
use shared::{
    domain::{ClientId, Command, Endpoint},
    protocol::{InboundMessage, OutboundMessage, QualityOfService},
};
use tokio::{
    sync::{broadcast, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::error::SessionError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound for connect plus subscribe.
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

/// Broker endpoint plus the one topic the session subscribes to and publishes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub endpoint: Endpoint,
    pub topic: String,
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} topic={}", self.endpoint, self.topic)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected {
        client_id: ClientId,
        target: SessionTarget,
    },
    Message(InboundMessage),
    Error(SessionError),
    Closed,
}

/// Returned by [`Session::start`]; identifies one connect attempt.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client_id: ClientId,
    target: SessionTarget,
    attempt: u64,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Waits until the session leaves `Connecting`.
    pub async fn settled(&mut self) -> SessionState {
        match self
            .state
            .wait_for(|state| *state != SessionState::Connecting)
            .await
        {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        }
    }
}

struct ActiveConnection {
    connection: Arc<dyn BrokerConnection>,
    event_task: JoinHandle<()>,
}

struct SessionInner {
    state: SessionState,
    attempt: u64,
    target: Option<SessionTarget>,
    cancel: Option<oneshot::Sender<()>>,
    active: Option<ActiveConnection>,
}

enum Interrupted {
    Cancelled,
    Failed(SessionError),
}

pub struct Session {
    client_id: ClientId,
    options: SessionOptions,
    connector: Arc<dyn BrokerConnector>,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new(connector: Arc<dyn BrokerConnector>, options: SessionOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            client_id: ClientId::generate(),
            options,
            connector,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                attempt: 0,
                target: None,
                cancel: None,
                active: None,
            }),
            state_tx,
            events,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn target(&self) -> Option<SessionTarget> {
        self.lock().target.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Moves to `Connecting` before returning and runs the attempt on a
    /// spawned task, so it must be called from within a tokio runtime.
    ///
    /// Starting again with the same target while `Connecting` or `Connected`
    /// returns a handle to the existing attempt.
    pub fn start(
        self: &Arc<Self>,
        endpoint: Endpoint,
        topic: impl Into<String>,
    ) -> Result<SessionHandle, SessionError> {
        let target = SessionTarget {
            endpoint,
            topic: topic.into(),
        };

        let (attempt, cancel_rx) = {
            let mut guard = self.lock();
            match guard.state {
                SessionState::Connecting | SessionState::Connected => {
                    return match &guard.target {
                        Some(active) if *active == target => {
                            debug!(
                                client_id = %self.client_id,
                                state = %guard.state,
                                "session: start ignored, already active"
                            );
                            Ok(self.handle(guard.attempt, target))
                        }
                        Some(active) => Err(SessionError::AlreadyActive {
                            active: active.to_string(),
                        }),
                        None => Err(SessionError::AlreadyActive {
                            active: "unknown target".to_string(),
                        }),
                    };
                }
                SessionState::Disconnecting | SessionState::Closed => {
                    return Err(SessionError::Closed);
                }
                SessionState::Idle | SessionState::Failed => {}
            }

            let (cancel_tx, cancel_rx) = oneshot::channel();
            guard.attempt += 1;
            guard.cancel = Some(cancel_tx);
            guard.target = Some(target.clone());
            self.set_state(&mut guard, SessionState::Connecting);
            (guard.attempt, cancel_rx)
        };

        info!(
            client_id = %self.client_id,
            endpoint = %target.endpoint,
            topic = %target.topic,
            attempt,
            "session: connecting"
        );

        tokio::spawn(Arc::clone(self).run_attempt(attempt, target.clone(), cancel_rx));
        Ok(self.handle(attempt, target))
    }

    /// Idempotent. Cancels an in-flight attempt, releases a held connection
    /// exactly once, and leaves the session `Closed`. A call overlapping one
    /// that is still releasing waits for it to finish.
    pub async fn stop(&self) {
        let release = {
            let mut guard = self.lock();
            let previous = guard.state;
            match previous {
                SessionState::Closed => return,
                SessionState::Disconnecting => None,
                _ => {
                    if let Some(cancel) = guard.cancel.take() {
                        let _ = cancel.send(());
                    }
                    let active = guard.active.take();
                    let next = if active.is_some() {
                        SessionState::Disconnecting
                    } else {
                        SessionState::Closed
                    };
                    self.set_state(&mut guard, next);
                    Some((previous, active))
                }
            }
        };

        let Some((previous, active)) = release else {
            let mut state = self.state_tx.subscribe();
            let _ = state
                .wait_for(|state| *state == SessionState::Closed)
                .await;
            return;
        };

        if let Some(active) = active {
            active.event_task.abort();
            if let Err(err) = active.connection.disconnect().await {
                warn!(client_id = %self.client_id, error = %err, "session: disconnect failed");
            }
            let mut guard = self.lock();
            self.set_state(&mut guard, SessionState::Closed);
        }

        info!(client_id = %self.client_id, from = %previous, "session: closed");
        let _ = self.events.send(SessionEvent::Closed);
    }

    /// Never suspends: rejected immediately unless `Connected`.
    pub fn publish(&self, command: Command) -> Result<(), SessionError> {
        let guard = self.lock();
        let (Some(active), Some(target), SessionState::Connected) =
            (&guard.active, &guard.target, guard.state)
        else {
            return Err(SessionError::NotConnected { state: guard.state });
        };

        active
            .connection
            .publish(OutboundMessage::command(target.topic.clone(), command))
            .map_err(|err| SessionError::Publish(format!("{err:#}")))?;
        debug!(%command, topic = %target.topic, "session: published");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, guard: &mut SessionInner, state: SessionState) {
        guard.state = state;
        self.state_tx.send_replace(state);
    }

    fn handle(&self, attempt: u64, target: SessionTarget) -> SessionHandle {
        SessionHandle {
            client_id: self.client_id.clone(),
            target,
            attempt,
            state: self.state_tx.subscribe(),
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        attempt: u64,
        target: SessionTarget,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let timeout = self.options.connect_timeout;
        let deadline = Instant::now() + timeout;
        let options = BrokerConnectOptions {
            endpoint: target.endpoint.clone(),
            client_id: self.client_id.clone(),
            keep_alive: self.options.keep_alive,
            clean_session: true,
        };

        let connection = match bounded(
            &mut cancel,
            deadline,
            timeout,
            self.connector.connect(options),
            |err| SessionError::Connect(format!("{err:#}")),
        )
        .await
        {
            Ok(connection) => connection,
            Err(Interrupted::Cancelled) => {
                debug!(attempt, "session: connect cancelled before broker answered");
                return;
            }
            Err(Interrupted::Failed(err)) => {
                self.fail_attempt(attempt, err);
                return;
            }
        };

        let broker_events = connection.subscribe_events();
        let subscribed = bounded(
            &mut cancel,
            deadline,
            timeout,
            connection.subscribe(&target.topic, QualityOfService::AtMostOnce),
            |err| SessionError::Subscribe(format!("{err:#}")),
        )
        .await;

        match subscribed {
            Ok(()) => {
                if !self.commit_connected(attempt, &target, &connection, broker_events) {
                    debug!(attempt, "session: stale connection released");
                    release(connection.as_ref()).await;
                }
            }
            Err(Interrupted::Cancelled) => {
                debug!(attempt, "session: subscribe cancelled, releasing connection");
                release(connection.as_ref()).await;
            }
            Err(Interrupted::Failed(err)) => {
                release(connection.as_ref()).await;
                self.fail_attempt(attempt, err);
            }
        }
    }

    fn commit_connected(
        self: &Arc<Self>,
        attempt: u64,
        target: &SessionTarget,
        connection: &Arc<dyn BrokerConnection>,
        broker_events: broadcast::Receiver<BrokerEvent>,
    ) -> bool {
        {
            let mut guard = self.lock();
            if guard.attempt != attempt || guard.state != SessionState::Connecting {
                return false;
            }
            let event_task = tokio::spawn(watch_connection(
                Arc::downgrade(self),
                attempt,
                broker_events,
            ));
            guard.cancel = None;
            guard.active = Some(ActiveConnection {
                connection: Arc::clone(connection),
                event_task,
            });
            self.set_state(&mut guard, SessionState::Connected);
        }

        info!(
            client_id = %self.client_id,
            endpoint = %target.endpoint,
            topic = %target.topic,
            "session: connected"
        );
        let _ = self.events.send(SessionEvent::Connected {
            client_id: self.client_id.clone(),
            target: target.clone(),
        });
        true
    }

    fn fail_attempt(&self, attempt: u64, err: SessionError) {
        {
            let mut guard = self.lock();
            if guard.attempt != attempt || guard.state != SessionState::Connecting {
                debug!(attempt, error = %err, "session: ignoring failure of stale attempt");
                return;
            }
            guard.cancel = None;
            self.set_state(&mut guard, SessionState::Failed);
        }

        warn!(client_id = %self.client_id, attempt, error = %err, "session: connect failed");
        let _ = self.events.send(SessionEvent::Error(err));
    }

    fn connection_lost(&self, attempt: u64) {
        let active = {
            let mut guard = self.lock();
            if guard.attempt != attempt || guard.state != SessionState::Connected {
                return;
            }
            self.set_state(&mut guard, SessionState::Failed);
            guard.active.take()
        };
        // The watch task is the caller; dropping its handle detaches it.
        drop(active);

        warn!(client_id = %self.client_id, attempt, "session: broker connection lost");
        let _ = self
            .events
            .send(SessionEvent::Error(SessionError::ConnectionLost));
    }
}

async fn bounded<T, F>(
    cancel: &mut oneshot::Receiver<()>,
    deadline: Instant,
    timeout: Duration,
    operation: F,
    on_error: impl FnOnce(anyhow::Error) -> SessionError,
) -> Result<T, Interrupted>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        _ = cancel => Err(Interrupted::Cancelled),
        result = tokio::time::timeout_at(deadline, operation) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Interrupted::Failed(on_error(err))),
            Err(_) => Err(Interrupted::Failed(SessionError::ConnectTimeout { after: timeout })),
        },
    }
}

async fn release(connection: &dyn BrokerConnection) {
    if let Err(err) = connection.disconnect().await {
        warn!(error = %err, "session: failed to release connection");
    }
}

async fn watch_connection(
    session: Weak<Session>,
    attempt: u64,
    mut broker_events: broadcast::Receiver<BrokerEvent>,
) {
    loop {
        let event = match broker_events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session: broker events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => BrokerEvent::Closed,
        };

        let Some(session) = session.upgrade() else {
            return;
        };

        match event {
            BrokerEvent::Message(message) => {
                info!(
                    topic = %message.topic,
                    payload = %message.payload_text(),
                    "session: message received"
                );
                let _ = session.events.send(SessionEvent::Message(message));
            }
            BrokerEvent::Error(detail) => {
                warn!(error = %detail, "session: broker error");
                let _ = session
                    .events
                    .send(SessionEvent::Error(SessionError::Transport(detail)));
            }
            BrokerEvent::Closed => {
                session.connection_lost(attempt);
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
