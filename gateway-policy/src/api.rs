//! JSON error envelope shared by every HTTP surface.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::PolicyServiceError;
use crate::validation::FieldError;

/// Code for field validation failures.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Code for unparseable request bodies.
pub const INVALID_JSON: &str = "INVALID_JSON";
/// Code for missing resources.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Code for unexpected failures.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Code for requests without a tenant.
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";

/// Body of the error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Field-level details for validation failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<FieldError>,
}

/// `{ "error": { "code", "message", "details" } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error payload.
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    /// Builds an envelope without details.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                details: Vec::new(),
            },
        }
    }

    /// Envelope for a body that failed to parse.
    #[must_use]
    pub fn invalid_json(reason: impl std::fmt::Display) -> Self {
        Self::new(INVALID_JSON, format!("Invalid JSON: {reason}"))
    }
}

/// Maps a service error to its HTTP status and envelope.
///
/// Storage failures are logged here and reported with a generic message.
#[must_use]
pub fn error_response(err: &PolicyServiceError) -> (StatusCode, ErrorEnvelope) {
    let envelope = match err {
        PolicyServiceError::Validation(validation) => ErrorEnvelope {
            error: ErrorBody {
                code: err.code().to_owned(),
                message: "Validation failed".to_owned(),
                details: validation.errors().to_vec(),
            },
        },
        PolicyServiceError::Tier(tier) => ErrorEnvelope::new(err.code(), tier.message()),
        PolicyServiceError::NotFound { .. } => ErrorEnvelope::new(err.code(), "Policy not found"),
        PolicyServiceError::Storage(storage) => {
            error!(error = %storage, "policy storage failure");
            ErrorEnvelope::new(err.code(), "An internal error occurred")
        }
    };
    (err.status(), envelope)
}
