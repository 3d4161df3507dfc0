// Common types for the streaming module

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while talking to the archiver or managing a stream.
///
/// None of these are retried inside the crate: a failure terminates the
/// current handshake, read or run and is handed back to the caller.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Server unreachable, refused or the connect deadline expired
    #[error("Connection error: {0}")]
    Connect(String),

    /// Non-zero handshake status or a malformed server response
    #[error("{0}")]
    Protocol(String),

    /// No bytes arrived within the receive deadline
    #[error("Receive timeout after {0:?}")]
    Timeout(Duration),

    /// Peer closed the connection before the requested bytes arrived
    #[error("Connection closed by server")]
    Eof,

    /// Operation attempted on a closed subscription
    #[error("Subscription is closed")]
    Closed,

    #[error("Invalid channel mask: {0}")]
    InvalidMask(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Stream already running")]
    AlreadyRunning,

    /// Background task panicked or was cancelled by the runtime
    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// True for failures that end a run because the transport went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            StreamError::Eof | StreamError::Timeout(_) | StreamError::Io(_)
        )
    }
}

/// Current state of a monitor run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum MonitorState {
    /// Never started
    Idle,

    /// Subscription handshake in progress
    Connecting,

    /// Background reader is pumping blocks
    Running { started_at: i64, channel_id: u8 },

    /// Run ended, either by `stop()` or by a stream failure
    Stopped { reason: String },
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Counters for a monitor across all of its runs
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MonitorStats {
    pub runs_started: u64,
    pub blocks_received: u64,
    pub samples_received: u64,
}

/// Caller-owned reconnect policy applied between failed runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before each new attempt
    pub delay: Duration,

    /// Give up after this many consecutive failed runs (None = forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn never() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: Some(0),
        }
    }

    /// Delay before retry number `attempt` (1-based), or None once exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            StreamError::Protocol("bad mask".to_string()).to_string(),
            "bad mask"
        );
        assert_eq!(StreamError::Eof.to_string(), "Connection closed by server");
        assert!(StreamError::Timeout(Duration::from_millis(5)).is_disconnect());
        assert!(!StreamError::Closed.is_disconnect());
    }

    #[test]
    fn test_reconnect_policy() {
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(250),
            max_attempts: Some(2),
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(3), None);

        assert_eq!(ReconnectPolicy::never().next_delay(1), None);
        assert!(ReconnectPolicy::default().next_delay(1000).is_some());
    }

    #[test]
    fn test_state_serialization() {
        let state = MonitorState::Stopped {
            reason: "Stopped".to_string(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"type":"Stopped","data":{"reason":"Stopped"}}"#);
        let back: MonitorState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(MonitorState::default(), MonitorState::Idle);
    }
}
