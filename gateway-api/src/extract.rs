//! Request extractors for the caller identity headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use gateway_primitives::{PolicyId, TenantId};

use crate::error::{ApiError, BAD_REQUEST};

/// Header carrying the tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Header carrying the acting user.
pub const USER_HEADER: &str = "x-user-id";
/// Actor recorded when no user header is sent.
pub const DEFAULT_ACTOR: &str = "system";

/// Tenant and actor of the calling request.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Tenant every operation is scoped to.
    pub tenant: TenantId,
    /// User recorded as the author of changes.
    pub actor: String,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = header(parts, TENANT_HEADER)
            .and_then(|raw| TenantId::new(raw).ok())
            .ok_or_else(ApiError::unauthorized)?;
        let actor = header(parts, USER_HEADER).unwrap_or(DEFAULT_ACTOR).to_owned();
        Ok(Self { tenant, actor })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Parses a policy id path segment.
pub(crate) fn policy_id(raw: &str) -> Result<PolicyId, ApiError> {
    PolicyId::new(raw)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, BAD_REQUEST, "Invalid policy ID format"))
}
