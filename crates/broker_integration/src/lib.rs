use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{ClientId, Endpoint},
    protocol::{InboundMessage, OutboundMessage, QualityOfService},
};
use tokio::sync::broadcast;

pub mod mqtt;

pub use mqtt::MqttConnector;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConnectOptions {
    pub endpoint: Endpoint,
    pub client_id: ClientId,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

impl BrokerConnectOptions {
    pub fn new(endpoint: Endpoint, client_id: ClientId) -> Self {
        Self {
            endpoint,
            client_id,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Message(InboundMessage),
    Error(String),
    Closed,
}

/// A live broker connection. Dropping the last reference must not leave a
/// background task polling the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QualityOfService) -> anyhow::Result<()>;
    /// Hands the message to the transport without waiting for it to be
    /// written.
    fn publish(&self, message: OutboundMessage) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent>;
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        options: BrokerConnectOptions,
    ) -> anyhow::Result<Arc<dyn BrokerConnection>>;
}
