pub mod dispatcher;
pub mod error;
pub mod session;

pub use dispatcher::{DispatchOutcome, DispatchStats, Dispatcher};
pub use error::SessionError;
pub use session::{
    Session, SessionEvent, SessionHandle, SessionOptions, SessionState, SessionTarget,
};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
