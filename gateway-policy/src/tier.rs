//! Tier and license enforcement for policy mutations.

use std::env;
use std::sync::Arc;

use gateway_primitives::{PolicyId, TenantId};
use thiserror::Error;
use tracing::debug;

use crate::error::ServiceResult;
use crate::model::PolicyTier;
use crate::store::PolicyRepository;

/// Tenant-tier policies a community deployment may hold per tenant.
pub const COMMUNITY_POLICY_LIMIT: usize = 30;

/// Environment variable read by [`EnvLicenseChecker`].
pub const DEPLOYMENT_MODE_VAR: &str = "DEPLOYMENT_MODE";

/// Reports whether enterprise features are licensed.
pub trait LicenseChecker: Send + Sync {
    /// Returns true for enterprise deployments.
    fn is_enterprise(&self) -> bool;
}

/// License state fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticLicense {
    enterprise: bool,
}

impl StaticLicense {
    /// Community edition.
    #[must_use]
    pub const fn community() -> Self {
        Self { enterprise: false }
    }

    /// Enterprise edition.
    #[must_use]
    pub const fn enterprise() -> Self {
        Self { enterprise: true }
    }
}

impl LicenseChecker for StaticLicense {
    fn is_enterprise(&self) -> bool {
        self.enterprise
    }
}

/// Classifies a deployment mode string.
///
/// Empty and `community` are community; every other mode (`saas`,
/// `enterprise`, `banking`, `travel`, `healthcare`, ...) is enterprise.
#[must_use]
pub fn mode_is_enterprise(mode: &str) -> bool {
    let mode = mode.trim().to_lowercase();
    !(mode.is_empty() || mode == "community")
}

/// Reads the deployment mode from `DEPLOYMENT_MODE` on every check.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvLicenseChecker;

impl LicenseChecker for EnvLicenseChecker {
    fn is_enterprise(&self) -> bool {
        env::var(DEPLOYMENT_MODE_VAR).is_ok_and(|mode| mode_is_enterprise(&mode))
    }
}

/// Refusals issued by the tier gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TierError {
    /// System-tier policies cannot be created, updated or deleted via the API.
    SystemTierImmutable {
        /// Operation that was refused.
        operation: TierOperation,
    },
    /// Organization-tier policies need an enterprise license.
    OrgTierRequiresEnterprise,
    /// Community tenants are capped.
    PolicyLimitExceeded {
        /// Cap that was hit.
        limit: usize,
    },
}

impl std::fmt::Display for TierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Mutation checked by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOperation {
    /// Creation.
    Create,
    /// Update or delete.
    Modify,
}

impl TierError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SystemTierImmutable { .. } => "SYSTEM_TIER_IMMUTABLE",
            Self::OrgTierRequiresEnterprise => "ORG_TIER_REQUIRES_ENTERPRISE",
            Self::PolicyLimitExceeded { .. } => "POLICY_LIMIT_EXCEEDED",
        }
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::SystemTierImmutable {
                operation: TierOperation::Create,
            } => "System policies cannot be created via API".to_owned(),
            Self::SystemTierImmutable {
                operation: TierOperation::Modify,
            } => "System policies cannot be modified via API".to_owned(),
            Self::OrgTierRequiresEnterprise => {
                "Organization-tier policies require Enterprise license".to_owned()
            }
            Self::PolicyLimitExceeded { limit } => {
                format!("Policy limit of {limit} reached for Community edition")
            }
        }
    }
}

/// Applies tier rules before the store is touched.
#[derive(Clone)]
pub struct TierGate {
    license: Arc<dyn LicenseChecker>,
    repository: Arc<dyn PolicyRepository>,
    community_limit: usize,
}

impl TierGate {
    /// Creates a gate with the default community limit.
    #[must_use]
    pub fn new(license: Arc<dyn LicenseChecker>, repository: Arc<dyn PolicyRepository>) -> Self {
        Self {
            license,
            repository,
            community_limit: COMMUNITY_POLICY_LIMIT,
        }
    }

    /// Overrides the community limit.
    #[must_use]
    pub fn with_community_limit(mut self, limit: usize) -> Self {
        self.community_limit = limit;
        self
    }

    /// Returns true for enterprise deployments.
    #[must_use]
    pub fn is_enterprise(&self) -> bool {
        self.license.is_enterprise()
    }

    /// Tenant-tier cap applied to community deployments.
    #[must_use]
    pub fn community_limit(&self) -> usize {
        self.community_limit
    }

    /// Checks whether the tenant may create a policy of the given tier.
    ///
    /// # Errors
    ///
    /// Returns a tier refusal, or a storage error if counting fails.
    pub async fn authorize_create(&self, tenant: &TenantId, tier: PolicyTier) -> ServiceResult<()> {
        match tier {
            PolicyTier::System => Err(TierError::SystemTierImmutable {
                operation: TierOperation::Create,
            }
            .into()),
            PolicyTier::Organization if !self.is_enterprise() => {
                Err(TierError::OrgTierRequiresEnterprise.into())
            }
            PolicyTier::Organization => Ok(()),
            PolicyTier::Tenant => {
                if self.is_enterprise() {
                    return Ok(());
                }
                let count = self.repository.count_tenant_tier(tenant).await?;
                debug!(tenant = %tenant, count, limit = self.community_limit, "community policy count");
                if count >= self.community_limit {
                    return Err(TierError::PolicyLimitExceeded {
                        limit: self.community_limit,
                    }
                    .into());
                }
                Ok(())
            }
        }
    }

    /// Checks whether the policy may be updated or deleted.
    ///
    /// A missing policy passes; the operation itself reports not-found.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::SystemTierImmutable`] for system policies, or a
    /// storage error if the lookup fails.
    pub async fn authorize_modify(&self, tenant: &TenantId, id: &PolicyId) -> ServiceResult<()> {
        match self.repository.get(tenant, id).await? {
            Some(policy) if policy.is_system() => Err(TierError::SystemTierImmutable {
                operation: TierOperation::Modify,
            }
            .into()),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for TierGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierGate")
            .field("enterprise", &self.is_enterprise())
            .field("community_limit", &self.community_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyServiceError;
    use crate::model::{Action, Condition, PolicyDraft, PolicyType};
    use crate::store::MemoryPolicyRepository;
    use chrono::Utc;
    use serde_json::json;

    fn tenant() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    fn draft(name: &str) -> PolicyDraft {
        PolicyDraft::new(name, PolicyType::Content)
            .condition(Condition::new("query", "contains", json!("x")))
            .action(Action::new("log"))
    }

    fn gate(repo: &Arc<MemoryPolicyRepository>, enterprise: bool) -> TierGate {
        let license = if enterprise {
            StaticLicense::enterprise()
        } else {
            StaticLicense::community()
        };
        TierGate::new(Arc::new(license), repo.clone())
    }

    fn tier_code(result: ServiceResult<()>) -> &'static str {
        match result {
            Err(PolicyServiceError::Tier(err)) => err.code(),
            other => panic!("expected tier error, got {other:?}"),
        }
    }

    #[test]
    fn deployment_modes_classify() {
        assert!(!mode_is_enterprise(""));
        assert!(!mode_is_enterprise("Community"));
        assert!(mode_is_enterprise("saas"));
        assert!(mode_is_enterprise("HEALTHCARE"));
    }

    #[test]
    fn tier_errors_render_message_and_code() {
        let err = TierError::PolicyLimitExceeded { limit: 30 };
        assert_eq!(
            err.to_string(),
            "Policy limit of 30 reached for Community edition (POLICY_LIMIT_EXCEEDED)"
        );
    }

    #[tokio::test]
    async fn system_tier_is_never_creatable() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let result = gate(&repo, true).authorize_create(&tenant(), PolicyTier::System).await;
        assert_eq!(tier_code(result), "SYSTEM_TIER_IMMUTABLE");
    }

    #[tokio::test]
    async fn organization_tier_needs_enterprise() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let result = gate(&repo, false)
            .authorize_create(&tenant(), PolicyTier::Organization)
            .await;
        assert_eq!(tier_code(result), "ORG_TIER_REQUIRES_ENTERPRISE");
        assert!(gate(&repo, true)
            .authorize_create(&tenant(), PolicyTier::Organization)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn community_tenants_are_capped() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let gate = gate(&repo, false).with_community_limit(2);
        for name in ["one", "two"] {
            gate.authorize_create(&tenant(), PolicyTier::Tenant).await.unwrap();
            repo.create(&tenant(), draft(name), "alice").await.unwrap();
        }
        let result = gate.authorize_create(&tenant(), PolicyTier::Tenant).await;
        assert_eq!(tier_code(result), "POLICY_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn system_policies_cannot_be_modified_even_with_enterprise() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let system = draft("platform baseline")
            .tier(PolicyTier::System)
            .into_policy(tenant(), "platform", Utc::now())
            .unwrap();
        let id = system.id.clone();
        repo.seed(system).await;

        let result = gate(&repo, true).authorize_modify(&tenant(), &id).await;
        assert_eq!(tier_code(result), "SYSTEM_TIER_IMMUTABLE");
    }

    #[tokio::test]
    async fn missing_policies_pass_the_modify_check() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        assert!(gate(&repo, false)
            .authorize_modify(&tenant(), &PolicyId::random())
            .await
            .is_ok());
    }
}
