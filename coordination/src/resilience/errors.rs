//! Error taxonomy for calls to external services.
//!
//! External failures are structured values, not strings: the retry policy
//! asks a [`Classifier`] for an [`ErrorClass`] instead of matching on
//! messages.
//!
//! ## Default classification
//!
//! | Failure              | Class     |
//! |----------------------|-----------|
//! | HTTP 5xx             | Retryable |
//! | HTTP 429             | Retryable |
//! | HTTP 4xx (other)     | Permanent |
//! | Timeout              | Retryable |
//! | Network              | Retryable |
//! | Invalid response     | Permanent |
//! | Other                | Permanent |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::context::Cancelled;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient: 5xx, 429, timeouts, connection failures.
    Retryable,
    /// The same request will fail again: 4xx, malformed output.
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure reported by an external collaborator (analyzer, extractor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl ExternalError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Default classification used when no custom classifier is installed.
    pub fn default_class(&self) -> ErrorClass {
        match self {
            Self::Http { status, .. } if *status >= 500 || *status == 429 => {
                ErrorClass::Retryable
            }
            Self::Http { .. } => ErrorClass::Permanent,
            Self::Timeout(_) | Self::Network(_) => ErrorClass::Retryable,
            Self::InvalidResponse(_) | Self::Other(_) => ErrorClass::Permanent,
        }
    }
}

/// Pluggable retryability predicate.
pub type Classifier = Arc<dyn Fn(&ExternalError) -> ErrorClass + Send + Sync>;

/// The default classifier, see the table in the module docs.
pub fn default_classifier() -> Classifier {
    Arc::new(ExternalError::default_class)
}

/// Outcome of a protected call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Fast-fail: the breaker rejected the call and the operation never ran.
    #[error("Circuit '{breaker}' is open, retry after {retry_after:?}")]
    CircuitOpen {
        breaker: String,
        retry_after: Duration,
    },

    /// The operation ran and failed, after retries when the failure was retryable.
    #[error("Operation failed after {attempts} attempt(s) ({class}): {source}")]
    OperationFailed {
        #[source]
        source: ExternalError,
        class: ErrorClass,
        attempts: u32,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for protected calls
pub type ExecResult<T> = Result<T, ExecError>;

impl ExecError {
    /// Wrap a raw external failure from a single attempt.
    pub fn failed(source: ExternalError, class: ErrorClass) -> Self {
        Self::OperationFailed {
            source,
            class,
            attempts: 1,
        }
    }

    /// Classification seen by the retry policy.
    ///
    /// Fast-fails and cancellations are never retried.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OperationFailed { class, .. } => *class,
            Self::CircuitOpen { .. } | Self::Cancelled => ErrorClass::Permanent,
        }
    }

    /// Whether this failure should count against a circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed {
                class: ErrorClass::Retryable,
                ..
            }
        )
    }

    /// Overwrite the attempt count on an `OperationFailed`.
    pub fn with_attempts(self, attempts: u32) -> Self {
        match self {
            Self::OperationFailed { source, class, .. } => Self::OperationFailed {
                source,
                class,
                attempts,
            },
            other => other,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<Cancelled> for ExecError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}
