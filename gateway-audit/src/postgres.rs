//! PostgreSQL audit store writing to `audit_logs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_primitives::{AuditId, RequestId, TenantId};
use sqlx::types::Json;
use sqlx::{Acquire, Executor, PgPool, Postgres, QueryBuilder, Transaction};

use crate::entry::{
    AuditActor, AuditEntry, ComplianceFlag, PolicyDetails, ProviderUsage, SecurityMetrics,
};
use crate::error::{AuditError, AuditResult};
use crate::store::{AuditStore, AuditTransaction, SearchCriteria};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS audit_logs (
        id TEXT PRIMARY KEY,
        request_id TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        user_id TEXT NOT NULL,
        user_email TEXT NOT NULL,
        user_role TEXT NOT NULL,
        client_id TEXT,
        tenant_id TEXT NOT NULL,
        request_type TEXT NOT NULL,
        query_hash TEXT NOT NULL,
        policy_decision TEXT NOT NULL,
        policy_details JSONB,
        provider TEXT,
        model TEXT,
        response_time_ms BIGINT,
        tokens_used BIGINT,
        cost DOUBLE PRECISION,
        redacted_fields JSONB NOT NULL DEFAULT '[]',
        error_message TEXT,
        response_sample TEXT,
        compliance_flags JSONB NOT NULL DEFAULT '[]',
        security_metrics JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_user_email ON audit_logs (user_email)",
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_tenant_id ON audit_logs (tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_request_id ON audit_logs (request_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_policy_decision ON audit_logs (policy_decision)",
];

const INSERT_AUDIT: &str = r"
    INSERT INTO audit_logs (
        id, request_id, timestamp, user_id, user_email, user_role, client_id, tenant_id,
        request_type, query_hash, policy_decision, policy_details, provider, model,
        response_time_ms, tokens_used, cost, redacted_fields, error_message, response_sample,
        compliance_flags, security_metrics
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
";

const AUDIT_COLUMNS: &str = "id, request_id, timestamp, user_id, user_email, user_role, client_id, \
    tenant_id, request_type, query_hash, policy_decision, policy_details, provider, model, \
    response_time_ms, tokens_used, cost, redacted_fields, error_message, response_sample, \
    compliance_flags, security_metrics";

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    request_id: String,
    timestamp: DateTime<Utc>,
    user_id: String,
    user_email: String,
    user_role: String,
    client_id: Option<String>,
    tenant_id: String,
    request_type: String,
    query_hash: String,
    policy_decision: String,
    policy_details: Option<Json<PolicyDetails>>,
    provider: Option<String>,
    model: Option<String>,
    response_time_ms: Option<i64>,
    tokens_used: Option<i64>,
    cost: Option<f64>,
    redacted_fields: Json<Vec<String>>,
    error_message: Option<String>,
    response_sample: Option<String>,
    compliance_flags: Json<Vec<ComplianceFlag>>,
    security_metrics: Option<Json<SecurityMetrics>>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = AuditError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let corrupt = |e: gateway_primitives::Error| AuditError::store(format!("corrupt audit row: {e}"));
        let usage = row.provider.map(|provider| ProviderUsage {
            provider,
            model: row.model.unwrap_or_default(),
            response_time_ms: row.response_time_ms.and_then(|ms| u64::try_from(ms).ok()).unwrap_or_default(),
            tokens_used: row.tokens_used.and_then(|tokens| u64::try_from(tokens).ok()).unwrap_or_default(),
            cost: row.cost.unwrap_or_default(),
        });
        Ok(Self {
            id: AuditId::new(row.id).map_err(corrupt)?,
            request_id: RequestId::new(row.request_id).map_err(corrupt)?,
            timestamp: row.timestamp,
            actor: AuditActor {
                user_id: row.user_id,
                email: row.user_email,
                role: row.user_role,
            },
            client_id: row.client_id,
            tenant_id: TenantId::new(row.tenant_id).map_err(corrupt)?,
            request_type: row.request_type,
            query_hash: row.query_hash,
            decision: row
                .policy_decision
                .parse()
                .map_err(|reason: String| AuditError::store(format!("corrupt audit row: {reason}")))?,
            policy_details: row.policy_details.map(|details| details.0),
            usage,
            response_sample: row.response_sample,
            redacted_fields: row.redacted_fields.0,
            error_message: row.error_message,
            compliance_flags: row.compliance_flags.0,
            security_metrics: row.security_metrics.map(|metrics| metrics.0),
        })
    }
}

/// Audit store backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects lazily; the first batch opens the connection.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] when the URL cannot be parsed.
    pub fn connect_lazy(database_url: &str) -> AuditResult<Self> {
        let pool = PgPool::connect_lazy(database_url)
            .map_err(|e| AuditError::store(format!("Failed to configure audit pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Creates the `audit_logs` table and its indexes.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] when a statement fails.
    pub async fn migrate(&self) -> AuditResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AuditError::store(format!("Failed to create audit schema: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn begin(&self) -> AuditResult<Box<dyn AuditTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AuditError::transaction(format!("Failed to begin transaction: {e}")))?;
        Ok(Box::new(PostgresAuditTransaction { tx }))
    }

    async fn ping(&self) -> AuditResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AuditError::store(format!("Audit database unreachable: {e}")))?;
        Ok(())
    }

    async fn search(&self, criteria: &SearchCriteria) -> AuditResult<Vec<AuditEntry>> {
        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {AUDIT_COLUMNS} FROM audit_logs WHERE 1=1"));
        if let Some(email) = &criteria.user_email {
            query.push(" AND user_email = ").push_bind(email.clone());
        }
        if let Some(client) = &criteria.client_id {
            query.push(" AND client_id = ").push_bind(client.clone());
        }
        if let Some(kind) = &criteria.request_type {
            query.push(" AND request_type = ").push_bind(kind.clone());
        }
        if let Some(start) = criteria.start {
            query.push(" AND timestamp >= ").push_bind(start);
        }
        if let Some(end) = criteria.end {
            query.push(" AND timestamp <= ").push_bind(end);
        }
        query.push(" ORDER BY timestamp DESC");
        if let Some(limit) = criteria.limit.filter(|limit| *limit > 0) {
            query
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<AuditRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuditError::store(format!("Failed to search audit logs: {e}")))?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}

struct PostgresAuditTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AuditTransaction for PostgresAuditTransaction {
    async fn prepare(&mut self) -> AuditResult<()> {
        (&mut *self.tx)
            .prepare(INSERT_AUDIT)
            .await
            .map_err(|e| AuditError::transaction(format!("Failed to prepare audit insert: {e}")))?;
        Ok(())
    }

    async fn insert(&mut self, entry: &AuditEntry) -> AuditResult<()> {
        // Savepoint per row keeps the outer transaction usable after a failed insert.
        let mut savepoint = (&mut *self.tx)
            .begin()
            .await
            .map_err(|e| AuditError::store(format!("Failed to open savepoint: {e}")))?;
        let usage = entry.usage();
        sqlx::query(INSERT_AUDIT)
            .bind(entry.id().as_str())
            .bind(entry.request_id().as_str())
            .bind(entry.timestamp())
            .bind(&entry.actor().user_id)
            .bind(&entry.actor().email)
            .bind(&entry.actor().role)
            .bind(entry.client_id())
            .bind(entry.tenant_id().as_str())
            .bind(entry.request_type())
            .bind(entry.query_hash())
            .bind(entry.decision().as_str())
            .bind(entry.policy_details().map(Json))
            .bind(usage.map(|usage| usage.provider.as_str()))
            .bind(usage.map(|usage| usage.model.as_str()))
            .bind(usage.map(|usage| i64::try_from(usage.response_time_ms).unwrap_or(i64::MAX)))
            .bind(usage.map(|usage| i64::try_from(usage.tokens_used).unwrap_or(i64::MAX)))
            .bind(usage.map(|usage| usage.cost))
            .bind(Json(entry.redacted_fields()))
            .bind(entry.error_message())
            .bind(entry.response_sample())
            .bind(Json(entry.compliance_flags()))
            .bind(entry.security_metrics().map(Json))
            .execute(&mut *savepoint)
            .await
            .map_err(|e| AuditError::store(format!("Failed to insert audit entry: {e}")))?;
        savepoint
            .commit()
            .await
            .map_err(|e| AuditError::store(format!("Failed to release savepoint: {e}")))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AuditResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| AuditError::transaction(format!("Failed to commit audit batch: {e}")))
    }

    async fn rollback(self: Box<Self>) -> AuditResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| AuditError::transaction(format!("Failed to roll back audit batch: {e}")))
    }
}
