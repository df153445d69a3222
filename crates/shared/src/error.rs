use thiserror::Error;

use crate::domain::Command;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("unknown command: {0:?}")]
    Unknown(String),
    #[error("{0} is not a directional command")]
    NotADirection(Command),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("invalid broker uri {input:?}: {reason}")]
    Invalid { input: String, reason: String },
    #[error("unsupported broker scheme {0:?}, expected mqtt")]
    UnsupportedScheme(String),
    #[error("broker uri {0:?} has no host")]
    MissingHost(String),
}
