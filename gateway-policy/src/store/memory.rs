//! In-process policy repository.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::Utc;
use gateway_primitives::{PolicyId, TenantId};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    IMPORT_SUMMARY, ImportMode, ImportOutcome, ImportReport, ListPage, ListParams,
    PolicyRepository, SortKey, change_summary, create_failed_message, exists_message,
    log_version_failure, overwrite_failed_message,
};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    ChangeType, Policy, PolicyDraft, PolicyTier, PolicyVersionEntry, UpdatePolicyRequest,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    policies: HashMap<PolicyId, Policy>,
    versions: HashMap<PolicyId, Vec<PolicyVersionEntry>>,
}

impl MemoryState {
    fn owned(&self, tenant: &TenantId, id: &PolicyId) -> Option<&Policy> {
        self.policies.get(id).filter(|p| &p.tenant_id == tenant)
    }

    fn by_name(&self, tenant: &TenantId, name: &str) -> Option<PolicyId> {
        self.policies
            .values()
            .find(|p| &p.tenant_id == tenant && p.name == name)
            .map(|p| p.id.clone())
    }

    fn insert_new(&mut self, tenant: &TenantId, draft: PolicyDraft, actor: &str) -> StoreResult<Policy> {
        let policy = draft
            .into_policy(tenant.clone(), actor, Utc::now())
            .map_err(|kind| StoreError::Corrupt {
                reason: format!("unknown policy type `{kind}`"),
            })?;
        if self.policies.contains_key(&policy.id) {
            return Err(StoreError::database(format!(
                "policy id {} already exists",
                policy.id
            )));
        }
        self.policies.insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }
}

/// Repository backed by a lock-guarded map.
///
/// Imports stage their changes on a copy of the state and swap it in on
/// commit, so a failed commit leaves nothing behind.
#[derive(Debug, Default)]
pub struct MemoryPolicyRepository {
    state: RwLock<MemoryState>,
    fail_version_writes: AtomicBool,
    fail_commits: AtomicBool,
}

impl MemoryPolicyRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every version-history write fail, for exercising best-effort paths.
    pub fn fail_version_writes(&self, fail: bool) {
        self.fail_version_writes.store(fail, AtomicOrdering::SeqCst);
    }

    /// Makes import commits fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, AtomicOrdering::SeqCst);
    }

    /// Inserts a policy verbatim, bypassing validation and tier rules.
    ///
    /// Used to seed platform policies such as the system tier.
    pub async fn seed(&self, policy: Policy) {
        self.state
            .write()
            .await
            .policies
            .insert(policy.id.clone(), policy);
    }

    fn record_version(
        &self,
        state: &mut MemoryState,
        policy: &Policy,
        change_type: ChangeType,
        summary: String,
        actor: &str,
    ) {
        if self.fail_version_writes.load(AtomicOrdering::SeqCst) {
            log_version_failure(&policy.id, change_type, &"version store unavailable");
            return;
        }
        let entry = PolicyVersionEntry::capture(policy, change_type, summary, actor);
        state
            .versions
            .entry(policy.id.clone())
            .or_default()
            .push(entry);
    }

    fn import_item(
        &self,
        state: &mut MemoryState,
        tenant: &TenantId,
        draft: PolicyDraft,
        mode: ImportMode,
        actor: &str,
    ) -> ImportOutcome {
        let name = draft.name.clone();
        match (state.by_name(tenant, &name), mode) {
            (Some(_), ImportMode::Skip) => ImportOutcome::Skipped { name },
            (Some(_), ImportMode::Error) => ImportOutcome::Failed {
                message: exists_message(&name),
                name,
            },
            (Some(existing_id), ImportMode::Overwrite) => {
                let Some(existing) = state.policies.get_mut(&existing_id) else {
                    return ImportOutcome::Failed {
                        message: overwrite_failed_message(&name, &"policy vanished"),
                        name,
                    };
                };
                if existing.is_system() {
                    return ImportOutcome::Failed {
                        message: overwrite_failed_message(&name, &"system policies are immutable"),
                        name,
                    };
                }
                existing.overwrite_from(&draft, actor, Utc::now());
                let snapshot = existing.clone();
                self.record_version(
                    state,
                    &snapshot,
                    ChangeType::Update,
                    change_summary(ChangeType::Update, snapshot.version),
                    actor,
                );
                ImportOutcome::Updated { name }
            }
            (None, _) => match state.insert_new(tenant, draft, actor) {
                Ok(policy) => {
                    self.record_version(
                        state,
                        &policy,
                        ChangeType::Create,
                        IMPORT_SUMMARY.to_owned(),
                        actor,
                    );
                    ImportOutcome::Created { name }
                }
                Err(err) => ImportOutcome::Failed {
                    message: create_failed_message(&name, &err),
                    name,
                },
            },
        }
    }
}

fn compare(sort: SortKey, a: &Policy, b: &Policy) -> Ordering {
    let primary = match sort {
        SortKey::Name => a.name.cmp(&b.name),
        SortKey::Priority => a.priority.cmp(&b.priority),
        SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
        SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl PolicyRepository for MemoryPolicyRepository {
    async fn create(&self, tenant: &TenantId, draft: PolicyDraft, actor: &str) -> StoreResult<Policy> {
        let mut state = self.state.write().await;
        let policy = state.insert_new(tenant, draft, actor)?;
        self.record_version(
            &mut state,
            &policy,
            ChangeType::Create,
            change_summary(ChangeType::Create, policy.version),
            actor,
        );
        debug!(tenant = %tenant, policy_id = %policy.id, "policy created");
        Ok(policy)
    }

    async fn get(&self, tenant: &TenantId, id: &PolicyId) -> StoreResult<Option<Policy>> {
        Ok(self.state.read().await.owned(tenant, id).cloned())
    }

    async fn find_by_name(&self, tenant: &TenantId, name: &str) -> StoreResult<Option<Policy>> {
        let state = self.state.read().await;
        Ok(state
            .by_name(tenant, name)
            .and_then(|id| state.policies.get(&id).cloned()))
    }

    async fn list(&self, tenant: &TenantId, params: &ListParams) -> StoreResult<ListPage> {
        let state = self.state.read().await;
        let mut matching: Vec<&Policy> = state
            .policies
            .values()
            .filter(|p| &p.tenant_id == tenant && params.accepts(p))
            .collect();
        matching.sort_by(|a, b| {
            let ordering = compare(params.sort, a, b);
            if params.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });

        let total = matching.len() as u64;
        let skip = usize::try_from(params.offset()).unwrap_or(usize::MAX);
        let take = usize::try_from(params.page_size).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(skip)
            .take(take)
            .cloned()
            .collect();
        Ok(ListPage { items, total })
    }

    async fn count_tenant_tier(&self, tenant: &TenantId) -> StoreResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .policies
            .values()
            .filter(|p| &p.tenant_id == tenant && p.tier == PolicyTier::Tenant)
            .count())
    }

    async fn update(
        &self,
        tenant: &TenantId,
        id: &PolicyId,
        patch: &UpdatePolicyRequest,
        actor: &str,
    ) -> StoreResult<Option<Policy>> {
        let mut state = self.state.write().await;
        let Some(current) = state.owned(tenant, id).cloned() else {
            return Ok(None);
        };
        if patch.is_empty() {
            return Ok(Some(current));
        }

        let mut updated = current;
        let change_type = updated.apply_update(patch, actor, Utc::now());
        state.policies.insert(updated.id.clone(), updated.clone());
        self.record_version(
            &mut state,
            &updated,
            change_type,
            change_summary(change_type, updated.version),
            actor,
        );
        debug!(tenant = %tenant, policy_id = %id, version = updated.version, "policy updated");
        Ok(Some(updated))
    }

    async fn delete(&self, tenant: &TenantId, id: &PolicyId, actor: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(current) = state.owned(tenant, id).cloned() else {
            return Ok(false);
        };
        self.record_version(
            &mut state,
            &current,
            ChangeType::Delete,
            change_summary(ChangeType::Delete, current.version),
            actor,
        );
        state.policies.remove(id);
        debug!(tenant = %tenant, policy_id = %id, "policy deleted");
        Ok(true)
    }

    async fn versions(&self, tenant: &TenantId, id: &PolicyId) -> StoreResult<Vec<PolicyVersionEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<PolicyVersionEntry> = state
            .versions
            .get(id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| &entry.snapshot.tenant_id == tenant)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| b.version.cmp(&a.version).then(b.changed_at.cmp(&a.changed_at)));
        Ok(entries)
    }

    async fn export_all(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>> {
        Ok(self.list(tenant, &ListParams::everything()).await?.items)
    }

    async fn enabled_policies(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>> {
        let state = self.state.read().await;
        Ok(state
            .policies
            .values()
            .filter(|p| &p.tenant_id == tenant && p.enabled)
            .cloned()
            .collect())
    }

    async fn import_bulk(
        &self,
        tenant: &TenantId,
        drafts: Vec<PolicyDraft>,
        mode: ImportMode,
        actor: &str,
    ) -> StoreResult<ImportReport> {
        let mut state = self.state.write().await;
        let mut staged = state.clone();

        let report: ImportReport = drafts
            .into_iter()
            .map(|draft| self.import_item(&mut staged, tenant, draft, mode, actor))
            .collect();

        if self.fail_commits.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::transaction("commit rejected"));
        }
        *state = staged;
        Ok(report)
    }
}
