//! Error types for the reliability core

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type-erased error produced by a protected operation.
pub use tower::BoxError;

/// Result type alias for the reliability core
pub type Result<T> = std::result::Result<T, ReliabilityError>;

/// Failures raised by the core itself.
///
/// Admission failures come from the pool, `CircuitOpen` from the breaker.
/// Errors of the wrapped operation are never rewritten; `Operation` exists only
/// for callers that want to carry them in this type.
#[derive(Debug, Error)]
pub enum ReliabilityError {
    /// The pool wait queue is at `max_queue_size`
    #[error("pool queue is full ({max_queue_size} waiters)")]
    QueueFull { max_queue_size: usize },

    /// Waited `acquire_timeout` without being admitted
    #[error("timed out after {waited:?} waiting for a pool slot")]
    AcquireTimeout { waited: Duration },

    /// The pool is draining and admits nothing new
    #[error("pool is draining")]
    Draining,

    /// The breaker rejected the call without attempting it
    #[error("circuit '{name}' is open")]
    CircuitOpen {
        name: String,
        retry_in: Option<Duration>,
    },

    /// A configuration value broke an invariant
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Configuration file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error of the underlying operation
    #[error("{0}")]
    Operation(BoxError),
}

impl ReliabilityError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// True for pool admission failures (queue full, timeout, draining).
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::AcquireTimeout { .. } | Self::Draining
        )
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<BoxError> for ReliabilityError {
    fn from(err: BoxError) -> Self {
        match err.downcast::<ReliabilityError>() {
            Ok(own) => *own,
            Err(other) => Self::Operation(other),
        }
    }
}

/// Coarse kind of a provider failure, derived after retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QuotaExceeded,
    RateLimited,
    Timeout,
    Unavailable,
    Other,
}

impl ErrorKind {
    /// Whether requeueing the failed work is likely to help.
    pub fn is_recoverable(self) -> bool {
        match self {
            ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::Unavailable => true,
            ErrorKind::QuotaExceeded | ErrorKind::Other => false,
        }
    }
}

const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "resource_exhausted",
    "resource exhausted",
    "insufficient_quota",
    "billing",
];
const RATE_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests", "429"];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline exceeded"];
const UNAVAILABLE_MARKERS: &[&str] = &[
    "unavailable",
    "503",
    "502",
    "connection refused",
    "connection reset",
    "overloaded",
    "circuit",
    "pool is draining",
];

/// Classify a propagated error by its message.
///
/// Retry never calls this; provider wrappers use it after the fact, e.g. to
/// turn a "quota exceeded" message into [`ErrorKind::QuotaExceeded`].
pub fn classify_error(err: &dyn fmt::Display) -> ErrorKind {
    let msg = err.to_string().to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| msg.contains(m));
    if has(QUOTA_MARKERS) {
        ErrorKind::QuotaExceeded
    } else if has(RATE_MARKERS) {
        ErrorKind::RateLimited
    } else if has(TIMEOUT_MARKERS) {
        ErrorKind::Timeout
    } else if has(UNAVAILABLE_MARKERS) {
        ErrorKind::Unavailable
    } else {
        ErrorKind::Other
    }
}
