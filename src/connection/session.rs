//! Connection lifecycle state.

use std::fmt;

/// Lifecycle of an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Open and accepting requests
    #[default]
    Open,

    /// Graceful shutdown requested; the engine closes once the queue and
    /// active slot are empty
    Draining,

    /// The engine is closed
    Closed,
}

impl SessionState {
    /// Check if the session still accepts new requests.
    pub fn can_submit(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Draining)
    }

    /// Check if the engine has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Open => write!(f, "open"),
            SessionState::Draining => write!(f, "draining"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}
