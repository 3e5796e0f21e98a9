//! Connection and observer states
//!
//! Two separate state machines are tracked for the event stream:
//!
//! - [`ConnectionState`] is transport-level connectivity. It only says whether
//!   a stream is open, not whether the platform will talk to us on it.
//! - [`ObserverState`] is the application-level handshake progress. Only the
//!   connection manager moves it.
//!
//! ```text
//! Disconnected ─► Connecting ─► Joining ─► AwaitsGreet ─► Ready
//!       ▲                                                   │
//!       └────────────── Error / Disconnected ◄──────────────┘
//!                      (any state, then reconnect)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Application-level handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObserverState {
    #[default]
    Disconnected,
    Connecting,
    Joining,
    AwaitsGreet,
    Ready,
    Error,
}

impl ObserverState {
    /// Only a `Ready` stream accepts application sends.
    pub fn is_ready(self) -> bool {
        self == ObserverState::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObserverState::Disconnected => "disconnected",
            ObserverState::Connecting => "connecting",
            ObserverState::Joining => "joining",
            ObserverState::AwaitsGreet => "awaits_greet",
            ObserverState::Ready => "ready",
            ObserverState::Error => "error",
        }
    }
}

impl fmt::Display for ObserverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::TransientFailure => "transient_failure",
            ConnectionState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_states() {
        assert_eq!(ObserverState::default(), ObserverState::Disconnected);
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[test]
    fn test_only_ready_is_ready() {
        assert!(ObserverState::Ready.is_ready());
        assert!(!ObserverState::AwaitsGreet.is_ready());
        assert!(!ObserverState::Error.is_ready());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::TransientFailure).unwrap();
        assert_eq!(json, "\"transient_failure\"");
        assert_eq!(ObserverState::AwaitsGreet.to_string(), "awaits_greet");
    }
}
