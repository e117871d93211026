//! Narrow seams to the systems the pipeline delegates to.
//!
//! Provider selection and PII detection live outside the gateway core; the
//! pipeline only sees these traits.

use async_trait::async_trait;
use gateway_policy::PolicyRequest;
use serde::Serialize;
use thiserror::Error;

/// Provider details reported with a routed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderMetadata {
    /// Provider that answered, e.g. `openai`.
    pub provider: String,
    /// Model used.
    pub model: String,
    /// Provider-side latency in milliseconds.
    pub response_time_ms: u64,
    /// Tokens consumed.
    pub tokens_used: u64,
    /// Cost in USD.
    pub cost: f64,
}

/// Response returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderResponse {
    /// Response text.
    pub content: String,
    /// Provider details.
    pub metadata: ProviderMetadata,
}

/// Response after redaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessedResponse {
    /// Content safe to return.
    pub content: String,
    /// Names of the fields that were redacted.
    pub redacted_fields: Vec<String>,
}

/// Failure reported by a collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Every provider failed or none is configured.
    #[error("routing failed: {reason}")]
    Routing {
        /// Explanation suitable for the audit trail.
        reason: String,
    },
    /// Redaction failed.
    #[error("response processing failed: {reason}")]
    Processing {
        /// Explanation suitable for the audit trail.
        reason: String,
    },
}

impl CollaboratorError {
    /// Helper for routing failures.
    pub fn routing(reason: impl Into<String>) -> Self {
        Self::Routing { reason: reason.into() }
    }

    /// Helper for processing failures.
    pub fn processing(reason: impl Into<String>) -> Self {
        Self::Processing { reason: reason.into() }
    }
}

/// Routes an allowed request to a provider. Failover is the router's concern.
#[async_trait]
pub trait ProviderRouter: Send + Sync {
    /// Returns the provider response for the request.
    async fn route(&self, request: &PolicyRequest) -> Result<ProviderResponse, CollaboratorError>;
}

/// Detects and redacts sensitive content in provider responses.
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    /// Returns the possibly-redacted content and what was redacted.
    async fn process(
        &self,
        request: &PolicyRequest,
        response: &ProviderResponse,
    ) -> Result<ProcessedResponse, CollaboratorError>;
}

/// Returns responses unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProcessor;

#[async_trait]
impl ResponseProcessor for PassthroughProcessor {
    async fn process(
        &self,
        _request: &PolicyRequest,
        response: &ProviderResponse,
    ) -> Result<ProcessedResponse, CollaboratorError> {
        Ok(ProcessedResponse {
            content: response.content.clone(),
            redacted_fields: Vec::new(),
        })
    }
}

/// Router used when no provider is wired in; every request fails routing.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredRouter;

#[async_trait]
impl ProviderRouter for UnconfiguredRouter {
    async fn route(&self, _request: &PolicyRequest) -> Result<ProviderResponse, CollaboratorError> {
        Err(CollaboratorError::routing("no provider configured"))
    }
}
