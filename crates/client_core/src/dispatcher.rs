use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use shared::domain::{Command, Direction};
use tracing::{debug, warn};

use crate::{error::SessionError, session::Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    DroppedNotConnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub sent: u64,
    pub dropped_not_connected: u64,
    pub failed: u64,
}

#[derive(Default)]
struct DispatchCounters {
    sent: AtomicU64,
    dropped_not_connected: AtomicU64,
    failed: AtomicU64,
}

/// Entry point for whatever drives the vehicle. Presses publish their
/// direction; releasing any direction publishes `Stop`.
///
/// Publishing while the session is not connected is swallowed here and only
/// shows up in [`DispatchStats`] and the logs.
pub struct Dispatcher {
    session: Arc<Session>,
    counters: DispatchCounters,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            counters: DispatchCounters::default(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn on_press_start(&self, direction: Direction) -> DispatchOutcome {
        self.dispatch(direction.into())
    }

    pub fn on_press_end(&self, direction: Direction) -> DispatchOutcome {
        self.on_release(Some(direction))
    }

    /// Release when the caller may not know which control was held.
    pub fn on_release(&self, direction: Option<Direction>) -> DispatchOutcome {
        debug!(?direction, "dispatch: release");
        self.dispatch(Command::Stop)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped_not_connected: self.counters.dropped_not_connected.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn dispatch(&self, command: Command) -> DispatchOutcome {
        match self.session.publish(command) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Sent
            }
            Err(SessionError::NotConnected { state }) => {
                let dropped = self
                    .counters
                    .dropped_not_connected
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                warn!(%command, %state, dropped, "dispatch: dropped command, session not connected");
                DispatchOutcome::DroppedNotConnected
            }
            Err(err) => {
                let failed = self.counters.failed.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(%command, error = %err, failed, "dispatch: publish failed");
                DispatchOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
