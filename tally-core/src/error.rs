/*!
Error types for the Tally core.
*/

use crate::metric::MetricKind;
use std::io::ErrorKind;
use tally_retry::RetryableError;
use thiserror::Error;

/// Result type used throughout the Tally core.
pub type Result<T> = std::result::Result<T, TallyError>;

/// Errors that can occur while storing, ingesting or delivering metrics.
#[derive(Error, Debug)]
pub enum TallyError {
    /// I/O errors during file or socket operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed metric name, kind or value
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lookup of a metric that was never stored under the requested kind
    #[error("{kind} metric '{id}' not found")]
    NotFound { kind: MetricKind, id: String },

    /// Caller's network origin is outside the trusted subnet
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Failure to deliver a batch to the collector
    #[error("Transport error: {message}")]
    Transport { message: String, transient: bool },

    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TallyError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Counter total no longer fits in an `i64`
    pub fn counter_overflow(id: &str) -> Self {
        Self::Validation(format!("counter '{id}' would overflow"))
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Transport failure that is worth retrying (unreachable, timeout)
    pub fn transient_transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport {
            message: msg.into(),
            transient: true,
        }
    }

    /// Transport failure that retrying cannot fix (rejected request, bad payload)
    pub fn fatal_transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport {
            message: msg.into(),
            transient: false,
        }
    }

    pub fn not_found(kind: MetricKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Socket-level failures that usually clear up on their own.
pub(crate) fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted
    )
}

impl RetryableError for TallyError {
    fn is_transient(&self) -> bool {
        match self {
            TallyError::Transport { transient, .. } => *transient,
            TallyError::Io(err) => is_transient_io(err.kind()),
            _ => false,
        }
    }
}
