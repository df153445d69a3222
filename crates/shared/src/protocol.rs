use serde::{Deserialize, Serialize};

use crate::domain::Command;

/// Delivery quality for publishes and subscriptions. Controller traffic is
/// always fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QualityOfService,
    pub retain: bool,
}

impl OutboundMessage {
    /// Builds the wire message for a movement command: raw UTF-8 name,
    /// at-most-once, not retained.
    pub fn command(topic: impl Into<String>, command: Command) -> Self {
        Self {
            topic: topic.into(),
            payload: command.payload().to_vec(),
            qos: QualityOfService::AtMostOnce,
            retain: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Interprets the payload as a movement command, if it is one.
    pub fn command(&self) -> Option<Command> {
        std::str::from_utf8(&self.payload).ok()?.parse().ok()
    }
}
