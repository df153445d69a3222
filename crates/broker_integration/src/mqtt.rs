use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use shared::protocol::{InboundMessage, OutboundMessage, QualityOfService};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{BrokerConnectOptions, BrokerConnection, BrokerConnector, BrokerEvent};

const DEFAULT_REQUEST_CAPACITY: usize = 10;
const EVENT_CAPACITY: usize = 256;
// Older rumqttc releases assert a keep-alive of at least five seconds.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// `BrokerConnector` backed by rumqttc. The event loop it spawns never
/// reconnects on its own; a lost connection is reported as
/// `BrokerEvent::Closed`.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    request_capacity: usize,
}

impl MqttConnector {
    pub fn new() -> Self {
        Self {
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }

    pub fn with_request_capacity(request_capacity: usize) -> Self {
        Self {
            request_capacity: request_capacity.max(1),
        }
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn mqtt_options(options: &BrokerConnectOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(
        options.client_id.as_str(),
        options.endpoint.host.clone(),
        options.endpoint.port,
    );
    mqtt.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt.set_clean_session(options.clean_session);
    mqtt
}

pub(crate) fn to_mqtt_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> anyhow::Result<()> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(anyhow!("broker refused connection: {:?}", ack.code));
            }
            event => debug!(?event, "mqtt: event before connack"),
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: broadcast::Sender<BrokerEvent>,
    sub_acks: mpsc::UnboundedSender<SubAck>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = events.send(BrokerEvent::Message(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                }));
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(pkid = ack.pkid, "mqtt: suback received");
                let _ = sub_acks.send(ack);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt: broker sent disconnect");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt: disconnect written");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt: event loop stopped");
                let _ = events.send(BrokerEvent::Error(err.to_string()));
                break;
            }
        }
    }

    let _ = events.send(BrokerEvent::Closed);
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(
        &self,
        options: BrokerConnectOptions,
    ) -> anyhow::Result<Arc<dyn BrokerConnection>> {
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(&options), self.request_capacity);

        wait_for_connack(&mut eventloop)
            .await
            .with_context(|| format!("failed to connect to {}", options.endpoint))?;
        info!(
            endpoint = %options.endpoint,
            client_id = %options.client_id,
            "mqtt: connected"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let event_task = tokio::spawn(run_event_loop(eventloop, events.clone(), ack_tx));

        Ok(Arc::new(MqttConnection {
            client,
            events,
            sub_acks: Mutex::new(ack_rx),
            event_task,
        }))
    }
}

pub struct MqttConnection {
    client: AsyncClient,
    events: broadcast::Sender<BrokerEvent>,
    // rumqttc 0.24 does not expose the pkid of a queued SUBSCRIBE. Holding
    // this lock keeps one subscribe in flight, so the next SubAck is its own.
    // The sender lives in the event loop task; the channel closes with it.
    sub_acks: Mutex<mpsc::UnboundedReceiver<SubAck>>,
    event_task: JoinHandle<()>,
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    /// Resolves once the broker has acknowledged the subscription.
    async fn subscribe(&self, topic: &str, qos: QualityOfService) -> anyhow::Result<()> {
        let mut acks = self.sub_acks.lock().await;
        // Acks left over from a subscribe whose caller gave up.
        while acks.try_recv().is_ok() {}

        self.client
            .subscribe(topic, to_mqtt_qos(qos))
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;

        let ack = acks.recv().await.ok_or_else(|| {
            anyhow!("failed to subscribe to {topic}: connection closed before suback")
        })?;
        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(anyhow!(
                "broker rejected subscription to {topic} (pkid={})",
                ack.pkid
            ));
        }

        debug!(topic, pkid = ack.pkid, "mqtt: subscribed");
        Ok(())
    }

    fn publish(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.client
            .try_publish(
                message.topic,
                to_mqtt_qos(message.qos),
                message.retain,
                message.payload,
            )
            .context("failed to queue publish")
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if self.event_task.is_finished() {
            return Ok(());
        }

        let mut events = self.events.subscribe();
        self.client
            .disconnect()
            .await
            .context("failed to queue disconnect")?;

        // Give the event loop a chance to flush DISCONNECT before Drop aborts it.
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match events.recv().await {
                    Ok(BrokerEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                    _ => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("mqtt: event loop did not finish within disconnect grace period");
        }

        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/mqtt_tests.rs"]
mod tests;
