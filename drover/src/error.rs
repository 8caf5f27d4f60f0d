//! Error types for drover.
//!
//! Errors fall into two groups. Transport and execution errors are contained
//! by the component that produced them and turned into a retry, reject or
//! drop decision. Configuration and startup errors propagate to the
//! [`Manager`](crate::Manager) and end the process.

use thiserror::Error;

use crate::unit_of_work::{MessageId, UnitState};

/// Boxed error source carried by [`TransportError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A queue backend call (fetch, acknowledge, reject) failed.
#[derive(Debug, Error)]
#[error("transport error on queue `{queue}`: {message}")]
pub struct TransportError {
    /// Queue the failing call was made against.
    pub queue: String,
    /// Human readable description of the failure.
    pub message: String,
    #[source]
    source: Option<BoxError>,
}

impl TransportError {
    /// Create a transport error without an underlying cause.
    pub fn new(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error wrapping the backend's own error.
    pub fn with_source(
        queue: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            queue: queue.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Top-level error type for drover operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DroverError {
    /// Backend fetch / ack / reject failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Job logic returned or raised a failure.
    #[error("job `{job}` failed on attempt {attempt}: {message}")]
    JobExecution {
        job: String,
        attempt: u32,
        message: String,
    },

    /// A unit failed on its final allowed attempt.
    #[error("message {id} exhausted its attempts after attempt {attempt}")]
    AttemptsExhausted { id: MessageId, attempt: u32 },

    /// An execution slot (thread or child process) died unexpectedly.
    #[error("execution slot {slot} crashed: {reason}")]
    SlotCrash { slot: String, reason: String },

    /// In-flight units were abandoned because shutdown ran out of time.
    #[error("shutdown timed out with {abandoned} unit(s) in flight")]
    ShutdownTimeout { abandoned: usize },

    /// Required setting missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A terminal action was requested on a unit that is already settled.
    #[error("message {id} is already {state}")]
    AlreadySettled { id: MessageId, state: UnitState },

    /// The consumer that produced a unit is no longer alive.
    #[error("consumer for queue `{queue}` has been dropped")]
    ConsumerGone { queue: String },

    /// A hook failed abnormally.
    #[error("hook `{event}` failed: {source}")]
    Hook {
        event: String,
        #[source]
        source: BoxError,
    },

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// I/O failure talking to a child process or the terminal.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DroverError {
    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wrap an error returned by a hook.
    pub fn hook(event: impl Into<String>, error: anyhow::Error) -> Self {
        Self::Hook {
            event: event.into(),
            source: error.into(),
        }
    }

    /// Whether this error should stop the process rather than be contained.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = DroverError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_keeps_source() {
        let io = std::io::Error::other("connection reset");
        let err = TransportError::with_source("orders", "fetch failed", io);
        assert_eq!(
            err.to_string(),
            "transport error on queue `orders`: fetch failed"
        );
        let source = std::error::Error::source(&err).expect("source kept");
        assert_eq!(source.to_string(), "connection reset");
    }

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(DroverError::config("no jobs registered").is_fatal());
        assert!(
            !DroverError::from(TransportError::new("q", "boom")).is_fatal()
        );
        assert!(!DroverError::ShutdownTimeout { abandoned: 1 }.is_fatal());
    }

    #[test]
    fn test_hook_error_message_names_event() {
        let err =
            DroverError::hook("before_perform", anyhow::anyhow!("db down"));
        assert_eq!(err.to_string(), "hook `before_perform` failed: db down");
    }
}
