//! Integrations with remote policy-decision backends.

use std::sync::Arc;

use async_trait::async_trait;

use crate::contracts::PolicyRequest;
use crate::decision::PolicyEvaluation;
use crate::engine::PolicyEngine;
use crate::error::PolicyResult;

/// Trait implemented by remote governance backends.
#[async_trait]
pub trait GovernanceClient: Send + Sync {
    /// Evaluates the supplied request and returns the backend's verdict.
    async fn evaluate(&self, request: &PolicyRequest) -> PolicyResult<PolicyEvaluation>;
}

/// Policy engine adapter that delegates to a remote governance client.
#[derive(Clone)]
pub struct RemotePolicyEngine<C>
where
    C: GovernanceClient + 'static,
{
    client: Arc<C>,
}

impl<C> RemotePolicyEngine<C>
where
    C: GovernanceClient + 'static,
{
    /// Creates a new remote policy engine using the provided client.
    #[must_use]
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C> PolicyEngine for RemotePolicyEngine<C>
where
    C: GovernanceClient + 'static,
{
    async fn evaluate(&self, request: &PolicyRequest) -> PolicyResult<PolicyEvaluation> {
        self.client.evaluate(request).await
    }
}
