//! Error taxonomy for the stream engine
//!
//! Local, recoverable failures (a full queue, a failed recording write, a
//! malformed log line) are absorbed by the component that sees them and show
//! up in logs and [`StreamStats`](crate::stats::StreamStats) counters.
//! Connection and device failures travel up to the
//! [`StreamManager`](crate::stream::StreamManager).

use std::path::PathBuf;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors surfaced by the stream engine
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Invalid or contradictory configuration
    ///
    /// Always raised before any broker connection is attempted.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Broker unreachable, refused, or the connection was lost
    ///
    /// Requires a reconnect before the operation can succeed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker did not acknowledge a publish in time
    ///
    /// Retryable; the connection itself is still considered usable.
    #[error("Publish to '{topic}' not acknowledged within {timeout_ms}ms")]
    PublishTimeout { topic: String, timeout_ms: u64 },

    /// The dispatch queue was full and the message was dropped
    #[error("Dispatch queue full (capacity {capacity}), message on '{topic}' dropped")]
    Capacity { topic: String, capacity: usize },

    /// Reading or writing a recording failed
    #[error("Persistence error on {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A recording line could not be decoded
    #[error("Malformed record at line {line}: {reason}")]
    ReplayData { line: usize, reason: String },

    /// A call to the device collaborator failed
    #[error("Device error: {0}")]
    Device(String),

    /// A lifecycle operation was requested in a state that does not allow it
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Some background tasks did not stop within the timeout and were aborted
    #[error("Forced shutdown, aborted: {}", components.join(", "))]
    ForcedShutdown { components: Vec<String> },
}

impl StreamError {
    /// True for errors that may succeed when simply retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::PublishTimeout { .. } | StreamError::Capacity { .. }
        )
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StreamError::Persistence {
            path: path.into(),
            source,
        }
    }
}

impl From<rumqttc::ClientError> for StreamError {
    fn from(e: rumqttc::ClientError) -> Self {
        StreamError::Connection(e.to_string())
    }
}

impl From<rumqttc::ConnectionError> for StreamError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        StreamError::Connection(e.to_string())
    }
}
