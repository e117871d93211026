//! Policy CRUD, dry-run testing, history and bulk transfer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use gateway_primitives::{PolicyId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::contracts::{PolicyRequest, UserContext};
use crate::error::{PolicyServiceError, ServiceResult};
use crate::evaluator::evaluate_policy;
use crate::model::{Action, Policy, PolicyDraft, PolicyTier, PolicyVersionEntry, UpdatePolicyRequest};
use crate::store::{ImportMode, ImportReport, ListQuery, PolicyRepository};
use crate::tier::{LicenseChecker, TierError, TierGate};
use crate::validation::{FieldError, ValidationError, validate_create, validate_update};

/// Most policies accepted by a single import.
pub const MAX_IMPORT_POLICIES: usize = 100;

/// Pagination metadata attached to listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Current page.
    pub page: u32,
    /// Items per page.
    pub page_size: u32,
    /// Matching policies across all pages.
    pub total_items: u64,
    /// Number of pages.
    pub total_pages: u64,
}

/// Listing response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyListResponse {
    /// Policies on the requested page.
    pub policies: Vec<Policy>,
    /// Page metadata.
    pub pagination: Pagination,
}

/// Synthetic request for a dry run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPolicyRequest {
    /// Query text; required.
    #[serde(default)]
    pub query: String,
    /// Request type label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    /// Caller identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
    /// Client application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Extra facts addressable as `context.<key>`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl TestPolicyRequest {
    /// Creates a dry-run request for the query.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    fn into_request(self, tenant: &TenantId) -> PolicyRequest {
        let mut request = PolicyRequest::new(tenant.clone(), self.query)
            .with_user(self.user.unwrap_or_default())
            .with_context_map(self.context);
        if let Some(request_type) = self.request_type {
            request = request.with_request_type(request_type);
        }
        if let Some(client_id) = self.client_id {
            request = request.with_client(client_id);
        }
        request
    }
}

/// Dry-run result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPolicyResponse {
    /// Every condition held.
    pub matched: bool,
    /// A triggered action blocks.
    pub blocked: bool,
    /// Triggered actions, verbatim.
    pub actions: Vec<Action>,
    /// Human-readable summary.
    pub explanation: String,
    /// Evaluation time in milliseconds.
    pub eval_time_ms: f64,
    /// Message of the triggered block action, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_message: Option<String>,
}

/// Export bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyExport {
    /// Every policy of the tenant.
    pub policies: Vec<Policy>,
    /// When the export was taken.
    pub exported_at: DateTime<Utc>,
    /// Exporting tenant.
    pub tenant_id: TenantId,
}

/// Bulk import payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Policies to import.
    #[serde(default)]
    pub policies: Vec<PolicyDraft>,
    /// `skip` (default), `error` or `overwrite`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Orchestrates validation, tier rules and the repository.
#[derive(Clone)]
pub struct PolicyService {
    repository: Arc<dyn PolicyRepository>,
    gate: TierGate,
}

impl std::fmt::Debug for PolicyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyService")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl PolicyService {
    /// Creates a service over the repository and license state.
    #[must_use]
    pub fn new(repository: Arc<dyn PolicyRepository>, license: Arc<dyn LicenseChecker>) -> Self {
        let gate = TierGate::new(license, repository.clone());
        Self { repository, gate }
    }

    /// Overrides the community policy limit.
    #[must_use]
    pub fn with_community_limit(mut self, limit: usize) -> Self {
        self.gate = self.gate.with_community_limit(limit);
        self
    }

    /// Returns `true` when enterprise features are licensed.
    #[must_use]
    pub fn is_enterprise(&self) -> bool {
        self.gate.is_enterprise()
    }

    /// Maximum tenant-tier policies per tenant in community mode.
    #[must_use]
    pub fn community_limit(&self) -> usize {
        self.gate.community_limit()
    }

    /// Underlying repository.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn PolicyRepository> {
        &self.repository
    }

    /// Validates, gates and persists a new policy.
    ///
    /// # Errors
    ///
    /// Validation, tier or storage failures.
    pub async fn create_policy(
        &self,
        tenant: &TenantId,
        draft: PolicyDraft,
        actor: &str,
    ) -> ServiceResult<Policy> {
        validate_create(&draft)?;
        self.gate.authorize_create(tenant, draft.effective_tier()).await?;
        let policy = self.repository.create(tenant, draft, actor).await?;
        info!(tenant = %tenant, policy_id = %policy.id, name = %policy.name, "policy created");
        Ok(policy)
    }

    /// Fetches one policy.
    ///
    /// # Errors
    ///
    /// [`PolicyServiceError::NotFound`] when absent, or a storage failure.
    pub async fn get_policy(&self, tenant: &TenantId, id: &PolicyId) -> ServiceResult<Policy> {
        self.repository
            .get(tenant, id)
            .await?
            .ok_or_else(|| PolicyServiceError::not_found(id.as_str()))
    }

    /// Lists policies with filters, sorting and pagination.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn list_policies(
        &self,
        tenant: &TenantId,
        query: &ListQuery,
    ) -> ServiceResult<PolicyListResponse> {
        let params = query.normalize();
        let page = self.repository.list(tenant, &params).await?;
        let page_size = u64::from(params.page_size);
        Ok(PolicyListResponse {
            policies: page.items,
            pagination: Pagination {
                page: params.page,
                page_size: params.page_size,
                total_items: page.total,
                total_pages: page.total.div_ceil(page_size),
            },
        })
    }

    /// Applies a partial update.
    ///
    /// # Errors
    ///
    /// Validation, tier, not-found or storage failures.
    pub async fn update_policy(
        &self,
        tenant: &TenantId,
        id: &PolicyId,
        patch: UpdatePolicyRequest,
        actor: &str,
    ) -> ServiceResult<Policy> {
        validate_update(&patch)?;
        self.gate.authorize_modify(tenant, id).await?;
        let policy = self
            .repository
            .update(tenant, id, &patch, actor)
            .await?
            .ok_or_else(|| PolicyServiceError::not_found(id.as_str()))?;
        debug!(tenant = %tenant, policy_id = %id, version = policy.version, "policy update applied");
        Ok(policy)
    }

    /// Deletes a policy.
    ///
    /// # Errors
    ///
    /// Tier, not-found or storage failures.
    pub async fn delete_policy(&self, tenant: &TenantId, id: &PolicyId, actor: &str) -> ServiceResult<()> {
        self.gate.authorize_modify(tenant, id).await?;
        if self.repository.delete(tenant, id, actor).await? {
            info!(tenant = %tenant, policy_id = %id, "policy deleted");
            Ok(())
        } else {
            Err(PolicyServiceError::not_found(id.as_str()))
        }
    }

    /// Evaluates one policy against a synthetic request without side effects.
    ///
    /// # Errors
    ///
    /// Validation error for an empty query, not-found, or a storage failure.
    pub async fn test_policy(
        &self,
        tenant: &TenantId,
        id: &PolicyId,
        synthetic: TestPolicyRequest,
    ) -> ServiceResult<TestPolicyResponse> {
        if synthetic.query.trim().is_empty() {
            return Err(ValidationError::single("query", "Query is required for testing").into());
        }
        let policy = self.get_policy(tenant, id).await?;
        let request = synthetic.into_request(tenant);

        let started = Instant::now();
        let outcome = evaluate_policy(&policy, &request);
        let elapsed = started.elapsed();

        let explanation = if outcome.matched {
            format!(
                "Policy '{}' matched: all {} conditions evaluated to true",
                policy.name,
                policy.conditions.len()
            )
        } else {
            format!(
                "Policy '{}' did not match: one or more conditions evaluated to false",
                policy.name
            )
        };

        #[allow(clippy::cast_precision_loss)]
        let eval_time_ms = elapsed.as_micros() as f64 / 1000.0;
        Ok(TestPolicyResponse {
            matched: outcome.matched,
            blocked: outcome.blocks(),
            block_message: outcome.block_message().map(str::to_owned),
            actions: outcome.actions,
            explanation,
            eval_time_ms,
        })
    }

    /// Version history, newest first.
    ///
    /// # Errors
    ///
    /// Not-found when the policy never existed, or a storage failure.
    pub async fn policy_versions(
        &self,
        tenant: &TenantId,
        id: &PolicyId,
    ) -> ServiceResult<Vec<PolicyVersionEntry>> {
        let versions = self.repository.versions(tenant, id).await?;
        if versions.is_empty() && self.repository.get(tenant, id).await?.is_none() {
            return Err(PolicyServiceError::not_found(id.as_str()));
        }
        Ok(versions)
    }

    /// Exports every policy of the tenant.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn export_policies(&self, tenant: &TenantId) -> ServiceResult<PolicyExport> {
        let policies = self.repository.export_all(tenant).await?;
        Ok(PolicyExport {
            policies,
            exported_at: Utc::now(),
            tenant_id: tenant.clone(),
        })
    }

    /// Imports policies in one transaction scope.
    ///
    /// Every item is validated before anything is written.
    ///
    /// # Errors
    ///
    /// Validation or tier failures for the payload as a whole, or a storage
    /// failure opening or committing the import.
    pub async fn import_policies(
        &self,
        tenant: &TenantId,
        request: ImportRequest,
        actor: &str,
    ) -> ServiceResult<ImportReport> {
        let mode = Self::validate_import(&request)?;
        self.authorize_import(tenant, &request.policies).await?;

        let total = request.policies.len();
        let report = self
            .repository
            .import_bulk(tenant, request.policies, mode, actor)
            .await?;
        info!(
            tenant = %tenant,
            mode = %mode,
            total,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Import completed"
        );
        Ok(report)
    }

    fn validate_import(request: &ImportRequest) -> Result<ImportMode, ValidationError> {
        let mode = request
            .mode
            .as_deref()
            .unwrap_or_default()
            .parse::<ImportMode>()
            .map_err(|_| {
                ValidationError::single("mode", "Mode must be one of: skip, error, overwrite")
            })?;

        if request.policies.is_empty() {
            return Err(ValidationError::single("policies", "At least one policy is required"));
        }
        if request.policies.len() > MAX_IMPORT_POLICIES {
            return Err(ValidationError::single(
                "policies",
                format!("Maximum {MAX_IMPORT_POLICIES} policies per import"),
            ));
        }

        let problems: ValidationError = request
            .policies
            .iter()
            .enumerate()
            .filter_map(|(index, draft)| validate_create(draft).err().map(|err| (index, err)))
            .flat_map(|(index, err)| {
                err.errors()
                    .iter()
                    .map(|e| FieldError::new(format!("policies[{index}].{}", e.field), e.message.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        if problems.errors().is_empty() {
            Ok(mode)
        } else {
            Err(problems)
        }
    }

    /// System and organization items follow the create rules; on community
    /// deployments the names that would be newly created must fit the limit.
    async fn authorize_import(&self, tenant: &TenantId, drafts: &[PolicyDraft]) -> ServiceResult<()> {
        let mut new_tenant_tier = 0usize;
        let mut seen = HashSet::new();
        for draft in drafts {
            match draft.effective_tier() {
                PolicyTier::Tenant => {
                    let exists = self.repository.find_by_name(tenant, &draft.name).await?.is_some();
                    if !exists && seen.insert(draft.name.as_str()) {
                        new_tenant_tier += 1;
                    }
                }
                tier => self.gate.authorize_create(tenant, tier).await?,
            }
        }

        if new_tenant_tier > 0 && !self.gate.is_enterprise() {
            let limit = self.gate.community_limit();
            let current = self.repository.count_tenant_tier(tenant).await?;
            if current + new_tenant_tier > limit {
                return Err(TierError::PolicyLimitExceeded { limit }.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Condition, PolicyType};
    use crate::store::MemoryPolicyRepository;
    use crate::tier::StaticLicense;
    use serde_json::json;

    fn tenant() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    fn service(repo: &Arc<MemoryPolicyRepository>, enterprise: bool) -> PolicyService {
        let license = if enterprise {
            StaticLicense::enterprise()
        } else {
            StaticLicense::community()
        };
        PolicyService::new(repo.clone(), Arc::new(license))
    }

    fn block_password(name: &str) -> PolicyDraft {
        PolicyDraft::new(name, PolicyType::Content)
            .priority(100)
            .condition(Condition::new("query", "contains", json!("password")))
            .action(Action::new("block").with_config("message", json!("Credential sharing is not allowed")))
    }

    #[tokio::test]
    async fn thirty_first_community_policy_is_refused() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false);
        for index in 0..30 {
            service
                .create_policy(&tenant(), block_password(&format!("policy {index}")), "alice")
                .await
                .unwrap();
        }

        let err = service
            .create_policy(&tenant(), block_password("policy 30"), "alice")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PolicyServiceError::Tier(TierError::PolicyLimitExceeded { limit: 30 })
        ));
        assert_eq!(repo.count_tenant_tier(&tenant()).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn enterprise_tenants_are_not_capped() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, true).with_community_limit(1);
        service.create_policy(&tenant(), block_password("one"), "alice").await.unwrap();
        service.create_policy(&tenant(), block_password("two"), "alice").await.unwrap();
    }

    #[tokio::test]
    async fn system_policy_delete_is_refused_and_policy_survives() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let system = block_password("platform baseline")
            .tier(PolicyTier::System)
            .into_policy(tenant(), "platform", Utc::now())
            .unwrap();
        let id = system.id.clone();
        repo.seed(system.clone()).await;

        let err = service(&repo, true)
            .delete_policy(&tenant(), &id, "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyServiceError::Tier(ref tier) if tier.code() == "SYSTEM_TIER_IMMUTABLE"));
        assert_eq!(repo.get(&tenant(), &id).await.unwrap(), Some(system));
    }

    #[tokio::test]
    async fn validation_runs_before_tier_checks() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let draft = PolicyDraft {
            name: "x".into(),
            ..block_password("ignored")
        }
        .tier(PolicyTier::System);
        let err = service(&repo, false)
            .create_policy(&tenant(), draft, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyServiceError::Validation(ref v) if v.has_field("name")));
    }

    #[tokio::test]
    async fn dry_run_reports_block_and_explanation() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false);
        let policy = service
            .create_policy(&tenant(), block_password("Block credentials"), "alice")
            .await
            .unwrap();

        let result = service
            .test_policy(&tenant(), &policy.id, TestPolicyRequest::new("my password is hunter2"))
            .await
            .unwrap();
        assert!(result.matched);
        assert!(result.blocked);
        assert_eq!(result.actions.len(), 1);
        assert_eq!(
            result.block_message.as_deref(),
            Some("Credential sharing is not allowed")
        );
        assert_eq!(
            result.explanation,
            "Policy 'Block credentials' matched: all 1 conditions evaluated to true"
        );

        let result = service
            .test_policy(&tenant(), &policy.id, TestPolicyRequest::new("hello"))
            .await
            .unwrap();
        assert!(!result.matched);
        assert!(!result.blocked);
        assert!(result.actions.is_empty());
        assert!(result.explanation.contains("did not match"));
    }

    #[tokio::test]
    async fn dry_run_requires_a_query_and_an_existing_policy() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false);
        let err = service
            .test_policy(&tenant(), &PolicyId::random(), TestPolicyRequest::new("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyServiceError::Validation(_)));

        let err = service
            .test_policy(&tenant(), &PolicyId::random(), TestPolicyRequest::new("q"))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_and_delete_report_not_found() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false);
        let id = PolicyId::random();
        let patch = UpdatePolicyRequest {
            priority: Some(10),
            ..UpdatePolicyRequest::default()
        };
        assert!(matches!(
            service.update_policy(&tenant(), &id, patch, "bob").await,
            Err(PolicyServiceError::NotFound { .. })
        ));
        assert!(matches!(
            service.delete_policy(&tenant(), &id, "bob").await,
            Err(PolicyServiceError::NotFound { .. })
        ));
        assert!(matches!(
            service.policy_versions(&tenant(), &id).await,
            Err(PolicyServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn listing_reports_pagination() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false);
        for index in 0..5 {
            service
                .create_policy(&tenant(), block_password(&format!("policy {index}")), "alice")
                .await
                .unwrap();
        }
        let listing = service
            .list_policies(
                &tenant(),
                &ListQuery {
                    page: Some(2),
                    page_size: Some(2),
                    ..ListQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listing.policies.len(), 2);
        assert_eq!(
            listing.pagination,
            Pagination {
                page: 2,
                page_size: 2,
                total_items: 5,
                total_pages: 3
            }
        );
    }

    #[tokio::test]
    async fn import_validates_every_item_first() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false);
        let request = ImportRequest {
            policies: vec![block_password("fine"), PolicyDraft::default()],
            mode: None,
        };
        let err = service.import_policies(&tenant(), request, "alice").await.unwrap_err();
        assert!(matches!(err, PolicyServiceError::Validation(ref v) if v.has_field("policies[1].name")));
        assert!(repo.export_all(&tenant()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn import_rejects_unknown_modes_and_empty_payloads() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false);
        let err = service
            .import_policies(
                &tenant(),
                ImportRequest {
                    policies: vec![block_password("fine")],
                    mode: Some("merge".into()),
                },
                "alice",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyServiceError::Validation(ref v) if v.has_field("mode")));

        let err = service
            .import_policies(&tenant(), ImportRequest::default(), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyServiceError::Validation(ref v) if v.has_field("policies")));
    }

    #[tokio::test]
    async fn import_respects_community_limit_for_new_names() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false).with_community_limit(2);
        service.create_policy(&tenant(), block_password("existing"), "alice").await.unwrap();

        let request = ImportRequest {
            policies: vec![block_password("existing"), block_password("new one")],
            mode: None,
        };
        let report = service.import_policies(&tenant(), request, "alice").await.unwrap();
        assert_eq!((report.created, report.skipped), (1, 1));

        let request = ImportRequest {
            policies: vec![block_password("one too many")],
            mode: None,
        };
        let err = service.import_policies(&tenant(), request, "alice").await.unwrap_err();
        assert!(matches!(err, PolicyServiceError::Tier(TierError::PolicyLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn export_wraps_policies_with_tenant() {
        let repo = Arc::new(MemoryPolicyRepository::new());
        let service = service(&repo, false);
        service.create_policy(&tenant(), block_password("one"), "alice").await.unwrap();
        let export = service.export_policies(&tenant()).await.unwrap();
        assert_eq!(export.tenant_id, tenant());
        assert_eq!(export.policies.len(), 1);
    }
}
