//! Mapping of every failure to the JSON error envelope.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gateway_kernel::{PipelineError, SchedulerError};
use gateway_policy::PolicyServiceError;
use gateway_policy::api::{self, ErrorEnvelope};
use tracing::{error, warn};

/// Code for requests refused because the gateway is shutting down.
pub const UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
/// Code for failed provider routing.
pub const ROUTING_FAILED: &str = "ROUTING_FAILED";
/// Code for a routing deadline that passed.
pub const TIMEOUT: &str = "TIMEOUT";
/// Code for malformed path parameters.
pub const BAD_REQUEST: &str = "BAD_REQUEST";

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    envelope: ErrorEnvelope,
}

impl ApiError {
    /// Builds an error with a status, code and message.
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            envelope: ErrorEnvelope::new(code, message),
        }
    }

    /// Missing or unusable `X-Tenant-ID`.
    #[must_use]
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, api::UNAUTHORIZED, "Missing tenant ID")
    }

    /// Generic internal failure; the cause is logged, never returned.
    pub fn internal(cause: &dyn std::fmt::Display) -> Self {
        error!(error = %cause, "request failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            api::INTERNAL_ERROR,
            "An internal error occurred",
        )
    }

    /// HTTP status of the error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

impl From<PolicyServiceError> for ApiError {
    fn from(err: PolicyServiceError) -> Self {
        let (status, envelope) = api::error_response(&err);
        Self { status, envelope }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            envelope: ErrorEnvelope::invalid_json(rejection.body_text()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Collaborator(cause) => {
                warn!(error = %cause, "governed request failed downstream");
                Self::new(StatusCode::BAD_GATEWAY, ROUTING_FAILED, "The request could not be served")
            }
            PipelineError::Timeout { stage, after } => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                TIMEOUT,
                format!("{stage} did not finish within {}ms", after.as_millis()),
            ),
            PipelineError::Policy(cause) => Self::internal(&cause),
            PipelineError::Lifecycle(cause) => Self::internal(&cause),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Closed => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                UNAVAILABLE,
                "The gateway is shutting down",
            ),
            SchedulerError::Join(_) => Self::internal(&err),
        }
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;
