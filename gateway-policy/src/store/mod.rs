//! Versioned policy persistence.
//!
//! Repositories own version-history writes: every mutation records a
//! [`PolicyVersionEntry`] on a best-effort basis, so a failed history write is
//! logged and never fails the mutation itself.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use async_trait::async_trait;
use gateway_primitives::{PolicyId, TenantId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreResult;
use crate::model::{ChangeType, Policy, PolicyDraft, PolicyType, PolicyVersionEntry, UpdatePolicyRequest};

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryPolicyRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresPolicyRepository;

/// Default page size applied when the requested one is out of range.
pub const DEFAULT_PAGE_SIZE: u32 = 20;
/// Largest accepted page size.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Storage interface for tenant-scoped policies.
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Persists a validated draft as version 1 and records a `create` entry.
    async fn create(&self, tenant: &TenantId, draft: PolicyDraft, actor: &str) -> StoreResult<Policy>;

    /// Fetches a policy owned by the tenant.
    async fn get(&self, tenant: &TenantId, id: &PolicyId) -> StoreResult<Option<Policy>>;

    /// Looks up a policy by exact name within the tenant.
    async fn find_by_name(&self, tenant: &TenantId, name: &str) -> StoreResult<Option<Policy>>;

    /// Returns one page of the tenant's policies and the total match count.
    async fn list(&self, tenant: &TenantId, params: &ListParams) -> StoreResult<ListPage>;

    /// Counts the tenant's tenant-tier policies.
    async fn count_tenant_tier(&self, tenant: &TenantId) -> StoreResult<usize>;

    /// Applies a partial update.
    ///
    /// Returns `Ok(None)` when the policy does not exist and the current policy
    /// unchanged when the patch carries no fields.
    async fn update(
        &self,
        tenant: &TenantId,
        id: &PolicyId,
        patch: &UpdatePolicyRequest,
        actor: &str,
    ) -> StoreResult<Option<Policy>>;

    /// Records a `delete` entry and removes the policy. Returns false when absent.
    async fn delete(&self, tenant: &TenantId, id: &PolicyId, actor: &str) -> StoreResult<bool>;

    /// Version history, newest first.
    async fn versions(&self, tenant: &TenantId, id: &PolicyId) -> StoreResult<Vec<PolicyVersionEntry>>;

    /// Every policy of the tenant.
    async fn export_all(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>>;

    /// Enabled policies of the tenant, for the decision engine.
    async fn enabled_policies(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>>;

    /// Imports drafts in one transaction scope.
    ///
    /// Item failures are collected in the report; only opening or committing
    /// the transaction aborts the import.
    async fn import_bulk(
        &self,
        tenant: &TenantId,
        drafts: Vec<PolicyDraft>,
        mode: ImportMode,
        actor: &str,
    ) -> StoreResult<ImportReport>;
}

/// Whitelisted sort keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    /// Policy name.
    Name,
    /// Priority.
    Priority,
    /// Creation time.
    #[default]
    CreatedAt,
    /// Last update time.
    UpdatedAt,
}

impl SortKey {
    /// Parses a key, falling back to `created_at` for anything unknown.
    #[must_use]
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw {
            Some("name") => Self::Name,
            Some("priority") => Self::Priority,
            Some("updated_at") => Self::UpdatedAt,
            _ => Self::CreatedAt,
        }
    }

    /// Column name used in SQL ordering.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Priority => "priority",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }
}

/// Raw list parameters as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Type filter.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<PolicyType>,
    /// Enabled filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Case-insensitive text search over name and description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Sort key name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    /// `asc` or `desc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<String>,
    /// 1-based page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    /// Items per page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<i64>,
}

impl ListQuery {
    /// Applies defaults and clamps.
    #[must_use]
    pub fn normalize(&self) -> ListParams {
        let page = self
            .page
            .filter(|page| *page >= 1)
            .and_then(|page| u32::try_from(page).ok())
            .unwrap_or(1);
        let page_size = self
            .page_size
            .filter(|size| (1..=i64::from(MAX_PAGE_SIZE)).contains(size))
            .and_then(|size| u32::try_from(size).ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);

        ListParams {
            policy_type: self.policy_type,
            enabled: self.enabled,
            search: self
                .search
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            sort: SortKey::parse_lenient(self.sort_by.as_deref()),
            ascending: self
                .sort_order
                .as_deref()
                .is_some_and(|order| order.eq_ignore_ascii_case("asc")),
            page,
            page_size,
        }
    }
}

/// Normalized list parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListParams {
    /// Type filter.
    pub policy_type: Option<PolicyType>,
    /// Enabled filter.
    pub enabled: Option<bool>,
    /// Trimmed, non-empty search text.
    pub search: Option<String>,
    /// Sort key.
    pub sort: SortKey,
    /// Ascending when true; descending otherwise.
    pub ascending: bool,
    /// 1-based page.
    pub page: u32,
    /// Items per page.
    pub page_size: u32,
}

impl ListParams {
    /// Parameters that return everything in one page.
    #[must_use]
    pub fn everything() -> Self {
        Self {
            page_size: u32::MAX,
            ..ListQuery::default().normalize()
        }
    }

    /// Rows to skip.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    /// Returns true when the policy passes the filters.
    #[must_use]
    pub fn accepts(&self, policy: &Policy) -> bool {
        if self.policy_type.is_some_and(|kind| kind != policy.policy_type) {
            return false;
        }
        if self.enabled.is_some_and(|enabled| enabled != policy.enabled) {
            return false;
        }
        self.search.as_deref().is_none_or(|needle| {
            let needle = needle.to_lowercase();
            policy.name.to_lowercase().contains(&needle)
                || policy.description.to_lowercase().contains(&needle)
        })
    }
}

impl Default for ListParams {
    fn default() -> Self {
        ListQuery::default().normalize()
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    /// Policies on this page.
    pub items: Vec<Policy>,
    /// Total policies matching the filters.
    pub total: u64,
}

/// Behaviour when an imported name already exists in the tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Leave the existing policy alone.
    #[default]
    Skip,
    /// Record an error for the item.
    Error,
    /// Replace the existing policy's fields and bump its version.
    Overwrite,
}

impl Display for ImportMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Skip => "skip",
            Self::Error => "error",
            Self::Overwrite => "overwrite",
        })
    }
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "skip" => Ok(Self::Skip),
            "error" => Ok(Self::Error),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(other.to_owned()),
        }
    }
}

/// Per-item result of a bulk import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// A new policy was created.
    Created {
        /// Imported name.
        name: String,
    },
    /// An existing policy was overwritten.
    Updated {
        /// Imported name.
        name: String,
    },
    /// An existing policy was left unchanged.
    Skipped {
        /// Imported name.
        name: String,
    },
    /// The item failed; siblings are unaffected.
    Failed {
        /// Imported name.
        name: String,
        /// Reported message.
        message: String,
    },
}

/// Aggregated import result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Policies created.
    pub created: usize,
    /// Policies overwritten.
    pub updated: usize,
    /// Policies skipped.
    pub skipped: usize,
    /// One message per failed item.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ImportReport {
    /// Folds an item outcome into the report.
    pub fn record(&mut self, outcome: ImportOutcome) {
        match outcome {
            ImportOutcome::Created { .. } => self.created += 1,
            ImportOutcome::Updated { .. } => self.updated += 1,
            ImportOutcome::Skipped { .. } => self.skipped += 1,
            ImportOutcome::Failed { message, .. } => self.errors.push(message),
        }
    }
}

impl FromIterator<ImportOutcome> for ImportReport {
    fn from_iter<I: IntoIterator<Item = ImportOutcome>>(iter: I) -> Self {
        let mut report = Self::default();
        for outcome in iter {
            report.record(outcome);
        }
        report
    }
}

pub(crate) fn exists_message(name: &str) -> String {
    format!("Policy {name} already exists")
}

pub(crate) fn create_failed_message(name: &str, reason: &dyn Display) -> String {
    format!("Error creating policy {name}: {reason}")
}

pub(crate) fn overwrite_failed_message(name: &str, reason: &dyn Display) -> String {
    format!("Error updating policy {name}: {reason}")
}

pub(crate) fn change_summary(change_type: ChangeType, version: i32) -> String {
    match change_type {
        ChangeType::Create => "Policy created".to_owned(),
        ChangeType::Delete => "Policy deleted".to_owned(),
        ChangeType::Update | ChangeType::Enable | ChangeType::Disable => {
            format!("Policy updated to version {version}")
        }
    }
}

pub(crate) const IMPORT_SUMMARY: &str = "Policy created via import";

pub(crate) fn log_version_failure(
    policy_id: &PolicyId,
    change_type: ChangeType,
    err: &dyn Display,
) {
    warn!(
        policy_id = %policy_id,
        change_type = change_type.as_str(),
        error = %err,
        "failed to record policy version"
    );
}
