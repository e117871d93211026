//! Error types for the audit subsystem.

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors emitted by audit components.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The provided configuration was invalid.
    #[error("invalid audit configuration: {0}")]
    InvalidConfig(&'static str),
    /// Underlying I/O failure while reading or writing the journal.
    #[error("i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },
    /// Serialization or deserialization error.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: SerdeError,
    },
    /// A batch transaction could not be opened, prepared or committed.
    #[error("audit transaction failed: {reason}")]
    Transaction {
        /// Human-readable reason describing the failure.
        reason: String,
    },
    /// The backing store rejected an operation.
    #[error("audit store error: {reason}")]
    Store {
        /// Human-readable reason describing the failure.
        reason: String,
    },
}

impl AuditError {
    /// Helper to construct transaction errors from string-like values.
    #[must_use]
    pub fn transaction(reason: impl Into<String>) -> Self {
        Self::Transaction {
            reason: reason.into(),
        }
    }

    /// Helper to construct store errors from string-like values.
    #[must_use]
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }
}

/// Result type alias for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;
