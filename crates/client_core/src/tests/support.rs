use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_integration::{BrokerConnectOptions, BrokerConnection, BrokerConnector, BrokerEvent};
use shared::{
    domain::Endpoint,
    protocol::{OutboundMessage, QualityOfService},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::{broadcast, oneshot, Mutex, Notify},
};

use crate::session::{SessionEvent, SessionState};

pub(crate) struct MockConnection {
    pub published: StdMutex<Vec<OutboundMessage>>,
    pub subscriptions: StdMutex<Vec<(String, QualityOfService)>>,
    pub disconnect_calls: AtomicU32,
    pub subscribe_started: Notify,
    pub events_tx: broadcast::Sender<BrokerEvent>,
    subscribe_error: Option<String>,
    subscribe_gate: Mutex<Option<oneshot::Receiver<()>>>,
    disconnect_gate: Mutex<Option<oneshot::Receiver<()>>>,
    publish_error: Option<String>,
}

impl MockConnection {
    pub fn ok() -> Self {
        Self {
            published: StdMutex::new(Vec::new()),
            subscriptions: StdMutex::new(Vec::new()),
            disconnect_calls: AtomicU32::new(0),
            subscribe_started: Notify::new(),
            events_tx: broadcast::channel(32).0,
            subscribe_error: None,
            subscribe_gate: Mutex::new(None),
            disconnect_gate: Mutex::new(None),
            publish_error: None,
        }
    }

    pub fn failing_subscribe(err: impl Into<String>) -> Self {
        let mut connection = Self::ok();
        connection.subscribe_error = Some(err.into());
        connection
    }

    pub fn failing_publish(err: impl Into<String>) -> Self {
        let mut connection = Self::ok();
        connection.publish_error = Some(err.into());
        connection
    }

    /// Subscribe blocks until the returned sender fires or is dropped.
    pub fn gated_subscribe() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let connection = Self::ok();
        *connection.subscribe_gate.try_lock().expect("fresh gate") = Some(rx);
        (connection, tx)
    }

    /// Disconnect blocks until the returned sender fires or is dropped.
    pub fn gated_disconnect() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let connection = Self::ok();
        *connection.disconnect_gate.try_lock().expect("fresh gate") = Some(rx);
        (connection, tx)
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().expect("published lock").clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn subscribe(&self, topic: &str, qos: QualityOfService) -> Result<()> {
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .push((topic.to_string(), qos));
        self.subscribe_started.notify_one();

        let gate = self.subscribe_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        match &self.subscribe_error {
            Some(err) => Err(anyhow!(err.clone())),
            None => Ok(()),
        }
    }

    fn publish(&self, message: OutboundMessage) -> Result<()> {
        if let Some(err) = &self.publish_error {
            return Err(anyhow!(err.clone()));
        }
        self.published
            .lock()
            .expect("published lock")
            .push(message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.disconnect_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events_tx.subscribe()
    }
}

/// Counts connect futures dropped before they produced a result.
struct CancelProbe {
    cancelled: Arc<AtomicU32>,
    armed: bool,
}

impl Drop for CancelProbe {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub(crate) struct MockConnector {
    pub connection: Arc<MockConnection>,
    pub options_seen: StdMutex<Vec<BrokerConnectOptions>>,
    pub connects: AtomicU32,
    pub handed_out: AtomicU32,
    pub cancelled: Arc<AtomicU32>,
    connect_error: Option<String>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockConnector {
    pub fn ok(connection: Arc<MockConnection>) -> Self {
        Self {
            connection,
            options_seen: StdMutex::new(Vec::new()),
            connects: AtomicU32::new(0),
            handed_out: AtomicU32::new(0),
            cancelled: Arc::new(AtomicU32::new(0)),
            connect_error: None,
            gate: Mutex::new(None),
        }
    }

    pub fn failing(err: impl Into<String>) -> Self {
        let mut connector = Self::ok(Arc::new(MockConnection::ok()));
        connector.connect_error = Some(err.into());
        connector
    }

    /// Connect resolves only once the returned sender fires.
    pub fn gated(connection: Arc<MockConnection>) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let connector = Self::ok(connection);
        *connector.gate.try_lock().expect("fresh gate") = Some(rx);
        (connector, tx)
    }

    pub fn handed_out(&self) -> u32 {
        self.handed_out.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(&self, options: BrokerConnectOptions) -> Result<Arc<dyn BrokerConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.options_seen
            .lock()
            .expect("options lock")
            .push(options);

        let mut probe = CancelProbe {
            cancelled: Arc::clone(&self.cancelled),
            armed: true,
        };
        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        probe.armed = false;

        if let Some(err) = &self.connect_error {
            return Err(anyhow!(err.clone()));
        }
        self.handed_out.fetch_add(1, Ordering::SeqCst);
        Ok(self.connection.clone())
    }
}

pub(crate) async fn wait_for_state(
    session: &crate::session::Session,
    expected: SessionState,
) -> SessionState {
    let mut rx = session.watch_state();
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|state| *state == expected))
        .await
        .expect("state wait timeout")
        .map(|state| *state)
        .expect("state channel open")
}

pub(crate) async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event timeout")
        .expect("event channel open")
}

pub(crate) fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Minimal MQTT 3.1.1 broker for one client: accepts CONNECT and answers
/// every SUBSCRIBE with a SUBACK carrying `suback_code`.
pub(crate) async fn fake_mqtt_broker(suback_code: u8) -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = [0u8; 1024];
        match socket.read(&mut buf).await {
            Ok(n) if n > 0 => {}
            _ => return,
        }
        if socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.is_err() {
            return;
        }
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let &[0x82, _, pkid_hi, pkid_lo, ..] = &buf[..n] {
                let suback = [0x90, 0x03, pkid_hi, pkid_lo, suback_code];
                if socket.write_all(&suback).await.is_err() {
                    break;
                }
            }
        }
    });

    Endpoint::new("127.0.0.1", port)
}
