use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{CommandParseError, EndpointError};

pub const MQTT_SCHEME: &str = "mqtt";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Movement command understood by the vehicle.
///
/// The wire identity of a command is its exact variant name, so `Throttle`
/// travels as the bytes of `"Throttle"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Throttle,
    Reverse,
    Left,
    Right,
    Stop,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Throttle,
        Command::Reverse,
        Command::Left,
        Command::Right,
        Command::Stop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Throttle => "Throttle",
            Command::Reverse => "Reverse",
            Command::Left => "Left",
            Command::Right => "Right",
            Command::Stop => "Stop",
        }
    }

    pub fn payload(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Command::ALL
            .into_iter()
            .find(|command| command.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CommandParseError::Unknown(trimmed.to_string()))
    }
}

/// One of the four directional controls. Releasing any of them stops the
/// vehicle, so `Stop` is not a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Throttle,
    Reverse,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Throttle,
        Direction::Reverse,
        Direction::Left,
        Direction::Right,
    ];
}

impl From<Direction> for Command {
    fn from(value: Direction) -> Self {
        match value {
            Direction::Throttle => Command::Throttle,
            Direction::Reverse => Command::Reverse,
            Direction::Left => Command::Left,
            Direction::Right => Command::Right,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Command::from(*self).as_str())
    }
}

impl FromStr for Direction {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Command>()? {
            Command::Throttle => Ok(Direction::Throttle),
            Command::Reverse => Ok(Direction::Reverse),
            Command::Left => Ok(Direction::Left),
            Command::Right => Ok(Direction::Right),
            Command::Stop => Err(CommandParseError::NotADirection(Command::Stop)),
        }
    }
}

/// Client identifier handed to the broker at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker address, rendered as `mqtt://<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|err| EndpointError::Invalid {
            input: raw.to_string(),
            reason: err.to_string(),
        })?;

        if url.scheme() != MQTT_SCHEME {
            return Err(EndpointError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| EndpointError::MissingHost(raw.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
        })
    }

    pub fn uri(&self) -> String {
        format!("{MQTT_SCHEME}://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}
