//! Error types for the policy store, service and decision engine.

use thiserror::Error;

use crate::tier::TierError;
use crate::validation::ValidationError;

/// Errors raised by policy repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database rejected an operation.
    #[error("policy database error: {reason}")]
    Database {
        /// Driver message with operation context.
        reason: String,
    },
    /// A transaction could not be opened or committed.
    #[error("policy transaction error: {reason}")]
    Transaction {
        /// Driver message with operation context.
        reason: String,
    },
    /// A stored document could not be encoded or decoded.
    #[error("policy serialization error: {source}")]
    Serialization {
        /// Underlying serde error.
        #[from]
        source: serde_json::Error,
    },
    /// A stored row holds a value the model does not accept.
    #[error("corrupt policy row: {reason}")]
    Corrupt {
        /// What was wrong with the row.
        reason: String,
    },
}

impl StoreError {
    /// Helper for database failures.
    pub fn database(reason: impl Into<String>) -> Self {
        Self::Database {
            reason: reason.into(),
        }
    }

    /// Helper for transaction failures.
    pub fn transaction(reason: impl Into<String>) -> Self {
        Self::Transaction {
            reason: reason.into(),
        }
    }
}

/// Result alias for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by [`crate::service::PolicyService`].
#[derive(Debug, Error)]
pub enum PolicyServiceError {
    /// Input failed field validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Tier or license rules refused the operation.
    #[error(transparent)]
    Tier(#[from] TierError),
    /// The addressed policy does not exist for the tenant.
    #[error("policy not found: {id}")]
    NotFound {
        /// Identifier that was looked up.
        id: String,
    },
    /// The repository failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl PolicyServiceError {
    /// Helper for not-found results.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// HTTP status the API layer answers with.
    #[must_use]
    pub fn status(&self) -> http::StatusCode {
        match self {
            Self::Validation(_) => http::StatusCode::BAD_REQUEST,
            Self::Tier(_) => http::StatusCode::FORBIDDEN,
            Self::NotFound { .. } => http::StatusCode::NOT_FOUND,
            Self::Storage(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Tier(tier) => tier.code(),
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Storage(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result alias for service operations.
pub type ServiceResult<T> = Result<T, PolicyServiceError>;

/// Errors surfaced by decision engines.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Loading policies failed; the request must not proceed.
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// Engine configuration error.
    #[error("invalid policy rule: {0}")]
    InvalidRule(String),
    /// Remote backend returned an error.
    #[error("policy backend failure: {reason}")]
    Backend {
        /// Human-readable explanation for logging and operators.
        reason: String,
    },
}

/// Result alias for decision engines.
pub type PolicyResult<T> = Result<T, PolicyError>;
