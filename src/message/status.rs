//! Connector message status codes and their lifecycle classification.
//!
//! Statuses are persisted as a single character (`R/F/T/S/Q/E/P`). Three of
//! them are terminal and four of them are tracked by statistics; the two
//! sets overlap but are not equal, so both predicates live here rather than
//! being derived ad hoc at call sites.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a single connector message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Persisted by the source dispatch transaction before any processing.
    Received,
    /// A filter rejected the message; terminal.
    Filtered,
    /// Filter accepted and the transformer completed.
    Transformed,
    /// Delivery succeeded; terminal.
    Sent,
    /// Delivery failed retryably and the message sits in a destination queue.
    Queued,
    /// Processing or delivery failed; terminal.
    Error,
    /// A destination row created ahead of execution (or reopened by reset).
    Pending,
}

/// Error returned when a persisted status character is not recognized.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown status code '{code}'")]
pub struct UnknownStatusCode {
    /// The character that failed to parse.
    pub code: char,
}

impl Status {
    /// Single-character persisted form.
    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Self::Received => 'R',
            Self::Filtered => 'F',
            Self::Transformed => 'T',
            Self::Sent => 'S',
            Self::Queued => 'Q',
            Self::Error => 'E',
            Self::Pending => 'P',
        }
    }

    /// Parses the single-character persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStatusCode`] for any character outside `R/F/T/S/Q/E/P`.
    pub fn from_char(code: char) -> Result<Self, UnknownStatusCode> {
        match code {
            'R' => Ok(Self::Received),
            'F' => Ok(Self::Filtered),
            'T' => Ok(Self::Transformed),
            'S' => Ok(Self::Sent),
            'Q' => Ok(Self::Queued),
            'E' => Ok(Self::Error),
            'P' => Ok(Self::Pending),
            other => Err(UnknownStatusCode { code: other }),
        }
    }

    /// Terminal statuses are never overwritten by the normal pipeline.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Filtered | Self::Error)
    }

    /// Only tracked statuses ever touch a statistics column.
    #[must_use]
    pub fn is_tracked(self) -> bool {
        matches!(
            self,
            Self::Received | Self::Filtered | Self::Sent | Self::Error
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}
