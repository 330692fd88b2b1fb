//! Shared error taxonomy for the pipeline.
//!
//! Connector adapters classify their failures into an [`ErrorKind`]; the
//! pipeline only ever consults [`ErrorKind::is_retryable`] to decide between
//! `QUEUED` and `ERROR`. Classification happens exactly once, at the
//! adapter boundary.

use thiserror::Error;

/// Failure classification for pipeline errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection refused/reset, unreachable host, DNS failure, timeout,
    /// aborted request. Retryable.
    Connection,
    /// Application-layer negative: SOAP fault, NAK, structured HTTP
    /// failure. Never retryable, even under a queue.
    Application,
    /// Unparseable message or data-type mismatch.
    Validation,
    /// A user script threw.
    Script,
    /// Database deadlocks, pool saturation, and other platform failures.
    Infrastructure,
}

impl ErrorKind {
    /// Whether a queue-enabled destination should requeue on this failure.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Connection)
    }
}

/// A classified failure raised by a destination send.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} error: {message}")]
pub struct SendError {
    /// Classification decided by the adapter.
    pub kind: ErrorKind,
    /// Human-readable failure description, recorded as error content.
    pub message: String,
    /// Connector-specific error code, `0` when none.
    pub error_code: i32,
}

impl SendError {
    /// A retryable transport-level failure.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Connection,
            message: message.into(),
            error_code: 0,
        }
    }

    /// A non-retryable application negative (SOAP fault, NAK).
    #[must_use]
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Application,
            message: message.into(),
            error_code: 0,
        }
    }

    /// An unparseable or mismatched payload.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            error_code: 0,
        }
    }

    /// Attaches a connector-specific error code.
    #[must_use]
    pub fn with_error_code(mut self, error_code: i32) -> Self {
        self.error_code = error_code;
        self
    }

    /// Shorthand for `self.kind.is_retryable()`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
