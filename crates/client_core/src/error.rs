use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("broker did not accept the session within {after:?}")]
    ConnectTimeout { after: Duration },
    #[error("failed to subscribe to session topic: {0}")]
    Subscribe(String),
    #[error("session is not connected (state: {state})")]
    NotConnected { state: SessionState },
    #[error("a session is already active on {active}")]
    AlreadyActive { active: String },
    #[error("session is closed; create a new session to reconnect")]
    Closed,
    #[error("failed to publish command: {0}")]
    Publish(String),
    #[error("broker reported an error: {0}")]
    Transport(String),
    #[error("broker connection lost")]
    ConnectionLost,
}

impl SessionError {
    /// Errors that end a connect attempt and leave the session `Failed`.
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Connect(_)
                | SessionError::ConnectTimeout { .. }
                | SessionError::Subscribe(_)
        )
    }
}
