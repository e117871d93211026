//! PostgreSQL policy repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_primitives::{PolicyId, TenantId};
use sqlx::types::Json;
use sqlx::{Acquire, PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    IMPORT_SUMMARY, ImportMode, ImportOutcome, ImportReport, ListPage, ListParams,
    PolicyRepository, change_summary, create_failed_message, exists_message, log_version_failure,
    overwrite_failed_message,
};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    Action, ChangeType, Condition, Policy, PolicyDraft, PolicyTier, PolicyVersionEntry,
    UpdatePolicyRequest,
};

const POLICY_COLUMNS: &str = "id, tenant_id, name, description, policy_type, tier, priority, \
    enabled, conditions, actions, category, tags, version, created_at, updated_at, \
    created_by, updated_by";

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        policy_type TEXT NOT NULL,
        tier TEXT NOT NULL DEFAULT 'tenant',
        priority INTEGER NOT NULL DEFAULT 0,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        conditions JSONB NOT NULL,
        actions JSONB NOT NULL,
        category TEXT,
        tags JSONB NOT NULL DEFAULT '[]',
        version INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        created_by TEXT NOT NULL DEFAULT '',
        updated_by TEXT NOT NULL DEFAULT ''
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_policies_tenant ON policies (tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_policies_tenant_name ON policies (tenant_id, name)",
    r"
    CREATE TABLE IF NOT EXISTS policy_versions (
        id UUID PRIMARY KEY,
        policy_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        snapshot JSONB NOT NULL,
        change_type TEXT NOT NULL,
        change_summary TEXT NOT NULL,
        changed_by TEXT NOT NULL,
        changed_at TIMESTAMPTZ NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_policy_versions_policy ON policy_versions (policy_id, version DESC)",
];

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: String,
    tenant_id: String,
    name: String,
    description: String,
    policy_type: String,
    tier: String,
    priority: i32,
    enabled: bool,
    conditions: Json<Vec<Condition>>,
    actions: Json<Vec<Action>>,
    category: Option<String>,
    tags: Json<Vec<String>>,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_by: String,
    updated_by: String,
}

impl TryFrom<PolicyRow> for Policy {
    type Error = StoreError;

    fn try_from(row: PolicyRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt { reason };
        Ok(Self {
            id: PolicyId::new(row.id).map_err(|e| corrupt(e.to_string()))?,
            tenant_id: TenantId::new(row.tenant_id).map_err(|e| corrupt(e.to_string()))?,
            name: row.name,
            description: row.description,
            policy_type: row
                .policy_type
                .parse()
                .map_err(|kind| corrupt(format!("unknown policy type `{kind}`")))?,
            tier: row
                .tier
                .parse()
                .map_err(|tier| corrupt(format!("unknown policy tier `{tier}`")))?,
            priority: row.priority,
            enabled: row.enabled,
            conditions: row.conditions.0,
            actions: row.actions.0,
            category: row.category,
            tags: row.tags.0,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by,
            updated_by: row.updated_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    policy_id: String,
    version: i32,
    snapshot: Json<Policy>,
    change_type: String,
    change_summary: String,
    changed_by: String,
    changed_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for PolicyVersionEntry {
    type Error = StoreError;

    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            policy_id: PolicyId::new(row.policy_id).map_err(|e| StoreError::Corrupt {
                reason: e.to_string(),
            })?,
            version: row.version,
            snapshot: row.snapshot.0,
            change_type: row.change_type.parse().map_err(|kind| StoreError::Corrupt {
                reason: format!("unknown change type `{kind}`"),
            })?,
            change_summary: row.change_summary,
            changed_by: row.changed_by,
            changed_at: row.changed_at,
        })
    }
}

async fn insert_policy(conn: &mut PgConnection, policy: &Policy) -> StoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO policies (id, tenant_id, name, description, policy_type, tier, priority,
                              enabled, conditions, actions, category, tags, version,
                              created_at, updated_at, created_by, updated_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ",
    )
    .bind(policy.id.as_str())
    .bind(policy.tenant_id.as_str())
    .bind(&policy.name)
    .bind(&policy.description)
    .bind(policy.policy_type.as_str())
    .bind(policy.tier.as_str())
    .bind(policy.priority)
    .bind(policy.enabled)
    .bind(Json(&policy.conditions))
    .bind(Json(&policy.actions))
    .bind(&policy.category)
    .bind(Json(&policy.tags))
    .bind(policy.version)
    .bind(policy.created_at)
    .bind(policy.updated_at)
    .bind(&policy.created_by)
    .bind(&policy.updated_by)
    .execute(conn)
    .await
    .map_err(|e| StoreError::database(format!("Failed to insert policy: {e}")))?;
    Ok(())
}

async fn write_policy(conn: &mut PgConnection, policy: &Policy) -> StoreResult<()> {
    sqlx::query(
        r"
        UPDATE policies
        SET name = $3, description = $4, policy_type = $5, priority = $6, enabled = $7,
            conditions = $8, actions = $9, category = $10, tags = $11, version = $12,
            updated_at = $13, updated_by = $14
        WHERE id = $1 AND tenant_id = $2
        ",
    )
    .bind(policy.id.as_str())
    .bind(policy.tenant_id.as_str())
    .bind(&policy.name)
    .bind(&policy.description)
    .bind(policy.policy_type.as_str())
    .bind(policy.priority)
    .bind(policy.enabled)
    .bind(Json(&policy.conditions))
    .bind(Json(&policy.actions))
    .bind(&policy.category)
    .bind(Json(&policy.tags))
    .bind(policy.version)
    .bind(policy.updated_at)
    .bind(&policy.updated_by)
    .execute(conn)
    .await
    .map_err(|e| StoreError::database(format!("Failed to update policy: {e}")))?;
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    tenant: &TenantId,
    id: &PolicyId,
    lock: bool,
) -> StoreResult<Option<Policy>> {
    let sql = format!(
        "SELECT {POLICY_COLUMNS} FROM policies WHERE id = $1 AND tenant_id = $2{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query_as::<_, PolicyRow>(&sql)
        .bind(id.as_str())
        .bind(tenant.as_str())
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::database(format!("Failed to fetch policy: {e}")))?;
    row.map(Policy::try_from).transpose()
}

async fn fetch_by_name(
    conn: &mut PgConnection,
    tenant: &TenantId,
    name: &str,
) -> StoreResult<Option<Policy>> {
    let sql = format!(
        "SELECT {POLICY_COLUMNS} FROM policies WHERE tenant_id = $1 AND name = $2 LIMIT 1"
    );
    let row = sqlx::query_as::<_, PolicyRow>(&sql)
        .bind(tenant.as_str())
        .bind(name)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::database(format!("Failed to find policy by name: {e}")))?;
    row.map(Policy::try_from).transpose()
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, tenant: &TenantId, params: &ListParams) {
    builder.push(" WHERE tenant_id = ");
    builder.push_bind(tenant.as_str().to_owned());
    if let Some(kind) = params.policy_type {
        builder.push(" AND policy_type = ");
        builder.push_bind(kind.as_str());
    }
    if let Some(enabled) = params.enabled {
        builder.push(" AND enabled = ");
        builder.push_bind(enabled);
    }
    if let Some(search) = &params.search {
        let pattern = format!("%{search}%");
        builder.push(" AND (name ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR description ILIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }
}

/// Repository storing policies and their history in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresPolicyRepository {
    pool: PgPool,
}

impl PostgresPolicyRepository {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds a pool that connects on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the URL cannot be parsed.
    pub fn connect_lazy(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect_lazy(database_url)
            .map_err(|e| StoreError::database(format!("Failed to configure policy pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Creates the `policies` and `policy_versions` tables when missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when a DDL statement fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::database(format!("Failed to apply policy schema: {e}")))?;
        }
        Ok(())
    }

    async fn connection(&self) -> StoreResult<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| StoreError::database(format!("Failed to acquire connection: {e}")))
    }

    async fn insert_version(&self, entry: &PolicyVersionEntry) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO policy_versions (id, policy_id, tenant_id, version, snapshot,
                                         change_type, change_summary, changed_by, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(entry.id)
        .bind(entry.policy_id.as_str())
        .bind(entry.snapshot.tenant_id.as_str())
        .bind(entry.version)
        .bind(Json(&entry.snapshot))
        .bind(entry.change_type.as_str())
        .bind(&entry.change_summary)
        .bind(&entry.changed_by)
        .bind(entry.changed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to insert policy version: {e}")))?;
        Ok(())
    }

    async fn record_version(
        &self,
        policy: &Policy,
        change_type: ChangeType,
        summary: String,
        actor: &str,
    ) {
        let entry = PolicyVersionEntry::capture(policy, change_type, summary, actor);
        if let Err(err) = self.insert_version(&entry).await {
            log_version_failure(&policy.id, change_type, &err);
        }
    }

    async fn import_item(
        conn: &mut PgConnection,
        tenant: &TenantId,
        draft: PolicyDraft,
        mode: ImportMode,
        actor: &str,
        history: &mut Vec<(Policy, ChangeType, String)>,
    ) -> ImportOutcome {
        let name = draft.name.clone();
        let existing = match fetch_by_name(conn, tenant, &name).await {
            Ok(existing) => existing,
            Err(err) => {
                return ImportOutcome::Failed {
                    message: create_failed_message(&name, &err),
                    name,
                };
            }
        };

        match (existing, mode) {
            (Some(_), ImportMode::Skip) => ImportOutcome::Skipped { name },
            (Some(_), ImportMode::Error) => ImportOutcome::Failed {
                message: exists_message(&name),
                name,
            },
            (Some(mut policy), ImportMode::Overwrite) => {
                if policy.tier == PolicyTier::System {
                    return ImportOutcome::Failed {
                        message: overwrite_failed_message(&name, &"system policies are immutable"),
                        name,
                    };
                }
                policy.overwrite_from(&draft, actor, Utc::now());
                match write_policy(conn, &policy).await {
                    Ok(()) => {
                        let summary = change_summary(ChangeType::Update, policy.version);
                        history.push((policy, ChangeType::Update, summary));
                        ImportOutcome::Updated { name }
                    }
                    Err(err) => ImportOutcome::Failed {
                        message: overwrite_failed_message(&name, &err),
                        name,
                    },
                }
            }
            (None, _) => {
                let policy = match draft.into_policy(tenant.clone(), actor, Utc::now()) {
                    Ok(policy) => policy,
                    Err(kind) => {
                        return ImportOutcome::Failed {
                            message: create_failed_message(&name, &format!("unknown policy type `{kind}`")),
                            name,
                        };
                    }
                };
                match insert_policy(conn, &policy).await {
                    Ok(()) => {
                        history.push((policy, ChangeType::Create, IMPORT_SUMMARY.to_owned()));
                        ImportOutcome::Created { name }
                    }
                    Err(err) => ImportOutcome::Failed {
                        message: create_failed_message(&name, &err),
                        name,
                    },
                }
            }
        }
    }
}

#[async_trait]
impl PolicyRepository for PostgresPolicyRepository {
    async fn create(&self, tenant: &TenantId, draft: PolicyDraft, actor: &str) -> StoreResult<Policy> {
        let policy = draft
            .into_policy(tenant.clone(), actor, Utc::now())
            .map_err(|kind| StoreError::Corrupt {
                reason: format!("unknown policy type `{kind}`"),
            })?;
        let mut conn = self.connection().await?;
        insert_policy(&mut conn, &policy).await?;
        debug!(tenant = %tenant, policy_id = %policy.id, "policy created");

        self.record_version(
            &policy,
            ChangeType::Create,
            change_summary(ChangeType::Create, policy.version),
            actor,
        )
        .await;
        Ok(policy)
    }

    async fn get(&self, tenant: &TenantId, id: &PolicyId) -> StoreResult<Option<Policy>> {
        let mut conn = self.connection().await?;
        fetch_one(&mut conn, tenant, id, false).await
    }

    async fn find_by_name(&self, tenant: &TenantId, name: &str) -> StoreResult<Option<Policy>> {
        let mut conn = self.connection().await?;
        fetch_by_name(&mut conn, tenant, name).await
    }

    async fn list(&self, tenant: &TenantId, params: &ListParams) -> StoreResult<ListPage> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM policies");
        push_filters(&mut count, tenant, params);
        let (total,): (i64,) = count
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to count policies: {e}")))?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {POLICY_COLUMNS} FROM policies"));
        push_filters(&mut select, tenant, params);
        select.push(format!(
            " ORDER BY {} {}, id LIMIT ",
            params.sort.column(),
            if params.ascending { "ASC" } else { "DESC" }
        ));
        select.push_bind(i64::from(params.page_size));
        select.push(" OFFSET ");
        select.push_bind(i64::try_from(params.offset()).unwrap_or(i64::MAX));

        let rows: Vec<PolicyRow> = select
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to list policies: {e}")))?;

        Ok(ListPage {
            items: rows
                .into_iter()
                .map(Policy::try_from)
                .collect::<StoreResult<_>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn count_tenant_tier(&self, tenant: &TenantId) -> StoreResult<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM policies WHERE tenant_id = $1 AND tier = 'tenant'",
        )
        .bind(tenant.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to count policies: {e}")))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn update(
        &self,
        tenant: &TenantId,
        id: &PolicyId,
        patch: &UpdatePolicyRequest,
        actor: &str,
    ) -> StoreResult<Option<Policy>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to begin transaction: {e}")))?;

        let Some(mut policy) = fetch_one(&mut tx, tenant, id, true).await? else {
            return Ok(None);
        };
        if patch.is_empty() {
            return Ok(Some(policy));
        }

        let change_type = policy.apply_update(patch, actor, Utc::now());
        write_policy(&mut tx, &policy).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to commit transaction: {e}")))?;
        debug!(tenant = %tenant, policy_id = %id, version = policy.version, "policy updated");

        self.record_version(
            &policy,
            change_type,
            change_summary(change_type, policy.version),
            actor,
        )
        .await;
        Ok(Some(policy))
    }

    async fn delete(&self, tenant: &TenantId, id: &PolicyId, actor: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let Some(current) = fetch_one(&mut conn, tenant, id, false).await? else {
            return Ok(false);
        };
        self.record_version(
            &current,
            ChangeType::Delete,
            change_summary(ChangeType::Delete, current.version),
            actor,
        )
        .await;

        let result = sqlx::query("DELETE FROM policies WHERE id = $1 AND tenant_id = $2")
            .bind(id.as_str())
            .bind(tenant.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete policy: {e}")))?;
        debug!(tenant = %tenant, policy_id = %id, "policy deleted");
        Ok(result.rows_affected() > 0)
    }

    async fn versions(&self, tenant: &TenantId, id: &PolicyId) -> StoreResult<Vec<PolicyVersionEntry>> {
        let rows = sqlx::query_as::<_, VersionRow>(
            r"
            SELECT id, policy_id, version, snapshot, change_type, change_summary,
                   changed_by, changed_at
            FROM policy_versions
            WHERE policy_id = $1 AND tenant_id = $2
            ORDER BY version DESC, changed_at DESC
            ",
        )
        .bind(id.as_str())
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to list policy versions: {e}")))?;

        rows.into_iter().map(PolicyVersionEntry::try_from).collect()
    }

    async fn export_all(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>> {
        Ok(self.list(tenant, &ListParams::everything()).await?.items)
    }

    async fn enabled_policies(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>> {
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM policies WHERE tenant_id = $1 AND enabled = TRUE"
        );
        let rows = sqlx::query_as::<_, PolicyRow>(&sql)
            .bind(tenant.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to load policies: {e}")))?;
        rows.into_iter().map(Policy::try_from).collect()
    }

    async fn import_bulk(
        &self,
        tenant: &TenantId,
        drafts: Vec<PolicyDraft>,
        mode: ImportMode,
        actor: &str,
    ) -> StoreResult<ImportReport> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to begin transaction: {e}")))?;

        let mut report = ImportReport::default();
        let mut history = Vec::new();
        for draft in drafts {
            let name = draft.name.clone();
            let mut savepoint = match tx.begin().await {
                Ok(savepoint) => savepoint,
                Err(err) => {
                    report.record(ImportOutcome::Failed {
                        message: create_failed_message(&name, &err),
                        name,
                    });
                    continue;
                }
            };

            let mut item_history = Vec::new();
            let outcome =
                Self::import_item(&mut savepoint, tenant, draft, mode, actor, &mut item_history).await;
            let settled = if matches!(outcome, ImportOutcome::Failed { .. }) {
                savepoint.rollback().await
            } else {
                savepoint.commit().await
            };
            match settled {
                Ok(()) => {
                    history.append(&mut item_history);
                    report.record(outcome);
                }
                Err(err) => {
                    warn!(policy = %name, error = %err, "import savepoint failed");
                    report.record(ImportOutcome::Failed {
                        message: create_failed_message(&name, &err),
                        name,
                    });
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to commit import: {e}")))?;

        for (policy, change_type, summary) in history {
            self.record_version(&policy, change_type, summary, actor).await;
        }
        Ok(report)
    }
}
