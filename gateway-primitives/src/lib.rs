//! Core shared types for the policy-governed request gateway.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;

/// Error type and result alias shared across the gateway.
pub use error::{Error, Result};
/// Identifiers that flow through policy, audit and pipeline code.
pub use ids::{AuditId, PolicyId, RequestId, TenantId};
