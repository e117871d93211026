//! Audit store contract and the in-memory implementation.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::entry::AuditEntry;
use crate::error::{AuditError, AuditResult};

/// Durable destination for audit batches.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Opens a transaction for one batch.
    async fn begin(&self) -> AuditResult<Box<dyn AuditTransaction>>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> AuditResult<()>;

    /// Returns entries matching the criteria, newest first.
    async fn search(&self, criteria: &SearchCriteria) -> AuditResult<Vec<AuditEntry>>;
}

/// One batch worth of writes.
#[async_trait]
pub trait AuditTransaction: Send {
    /// Prepares the insert statement. Called once per batch.
    async fn prepare(&mut self) -> AuditResult<()>;

    /// Inserts a single entry.
    async fn insert(&mut self, entry: &AuditEntry) -> AuditResult<()>;

    /// Commits every successful insert.
    async fn commit(self: Box<Self>) -> AuditResult<()>;

    /// Discards the batch.
    async fn rollback(self: Box<Self>) -> AuditResult<()>;
}

/// Filters accepted by [`AuditStore::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Exact user email.
    pub user_email: Option<String>,
    /// Exact client identifier.
    pub client_id: Option<String>,
    /// Exact request type.
    pub request_type: Option<String>,
    /// Inclusive lower bound on the timestamp.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the timestamp.
    pub end: Option<DateTime<Utc>>,
    /// Maximum number of entries returned.
    pub limit: Option<usize>,
}

impl SearchCriteria {
    /// Returns `true` when the entry passes every filter.
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.user_email
            .as_deref()
            .is_none_or(|email| entry.actor().email == email)
            && self
                .client_id
                .as_deref()
                .is_none_or(|client| entry.client_id() == Some(client))
            && self
                .request_type
                .as_deref()
                .is_none_or(|kind| entry.request_type() == kind)
            && self.start.is_none_or(|start| entry.timestamp() >= start)
            && self.end.is_none_or(|end| entry.timestamp() <= end)
    }

    /// Filters, orders newest first and applies the limit.
    #[must_use]
    pub fn select(&self, entries: impl IntoIterator<Item = AuditEntry>) -> Vec<AuditEntry> {
        let mut selected: Vec<AuditEntry> = entries.into_iter().filter(|entry| self.matches(entry)).collect();
        selected.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        if let Some(limit) = self.limit.filter(|limit| *limit > 0) {
            selected.truncate(limit);
        }
        selected
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    committed: RwLock<Vec<AuditEntry>>,
    rejected_requests: RwLock<HashSet<String>>,
    fail_begin: AtomicBool,
    fail_prepare: AtomicBool,
    fail_commit: AtomicBool,
    fail_ping: AtomicBool,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Audit store keeping committed entries in memory, with fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditStore {
    inner: Arc<MemoryInner>,
}

impl MemoryAuditStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `begin` fail.
    pub fn fail_begin(&self, fail: bool) {
        self.inner.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Makes `prepare` fail.
    pub fn fail_prepare(&self, fail: bool) {
        self.inner.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Makes `commit` fail.
    pub fn fail_commit(&self, fail: bool) {
        self.inner.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Makes `ping` fail.
    pub fn fail_ping(&self, fail: bool) {
        self.inner.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// Makes inserts for the given request id fail.
    pub async fn reject_request(&self, request_id: impl Into<String>) {
        self.inner.rejected_requests.write().await.insert(request_id.into());
    }

    /// Returns committed entries in commit order.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.inner.committed.read().await.clone()
    }

    /// Number of transactions opened.
    #[must_use]
    pub fn begins(&self) -> usize {
        self.inner.begins.load(Ordering::SeqCst)
    }

    /// Number of transactions committed.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Number of transactions rolled back.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn begin(&self) -> AuditResult<Box<dyn AuditTransaction>> {
        if self.inner.fail_begin.load(Ordering::SeqCst) {
            return Err(AuditError::transaction("begin refused"));
        }
        self.inner.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }

    async fn ping(&self) -> AuditResult<()> {
        if self.inner.fail_ping.load(Ordering::SeqCst) {
            return Err(AuditError::store("store unreachable"));
        }
        Ok(())
    }

    async fn search(&self, criteria: &SearchCriteria) -> AuditResult<Vec<AuditEntry>> {
        Ok(criteria.select(self.inner.committed.read().await.iter().cloned()))
    }
}

struct MemoryTransaction {
    inner: Arc<MemoryInner>,
    staged: Vec<AuditEntry>,
}

#[async_trait]
impl AuditTransaction for MemoryTransaction {
    async fn prepare(&mut self) -> AuditResult<()> {
        if self.inner.fail_prepare.load(Ordering::SeqCst) {
            return Err(AuditError::transaction("prepare refused"));
        }
        Ok(())
    }

    async fn insert(&mut self, entry: &AuditEntry) -> AuditResult<()> {
        if self
            .inner
            .rejected_requests
            .read()
            .await
            .contains(entry.request_id().as_str())
        {
            return Err(AuditError::store(format!("insert rejected for {}", entry.request_id())));
        }
        self.staged.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AuditResult<()> {
        let MemoryTransaction { inner, staged } = *self;
        if inner.fail_commit.load(Ordering::SeqCst) {
            inner.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(AuditError::transaction("commit refused"));
        }
        inner.committed.write().await.extend(staged);
        inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AuditResult<()> {
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditActor, AuditDecision};
    use chrono::Duration;
    use gateway_primitives::{RequestId, TenantId};

    fn entry(email: &str, request_type: &str, at: DateTime<Utc>) -> AuditEntry {
        AuditEntry::builder(RequestId::random(), TenantId::new("acme").unwrap(), AuditDecision::Allowed)
            .actor(AuditActor {
                user_id: "7".into(),
                email: email.into(),
                role: "analyst".into(),
            })
            .request_type(request_type)
            .timestamp(at)
            .build()
    }

    #[tokio::test]
    async fn search_filters_orders_and_limits() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        tx.prepare().await.unwrap();
        for (offset, email, kind) in [(3, "a@x.io", "chat"), (2, "b@x.io", "chat"), (1, "a@x.io", "sql"), (0, "a@x.io", "chat")] {
            tx.insert(&entry(email, kind, now - Duration::minutes(offset))).await.unwrap();
        }
        tx.commit().await.unwrap();

        let by_user = store
            .search(&SearchCriteria {
                user_email: Some("a@x.io".into()),
                request_type: Some("chat".into()),
                ..SearchCriteria::default()
            })
            .await
            .unwrap();
        assert_eq!(by_user.len(), 2);
        assert!(by_user[0].timestamp() > by_user[1].timestamp());

        let recent = store
            .search(&SearchCriteria {
                start: Some(now - Duration::seconds(150)),
                limit: Some(1),
                ..SearchCriteria::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].timestamp(), now);
    }

    #[tokio::test]
    async fn rolled_back_batches_leave_no_trace() {
        let store = MemoryAuditStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&entry("a@x.io", "chat", Utc::now())).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.entries().await.is_empty());
        assert_eq!(store.rollbacks(), 1);
        assert_eq!(store.commits(), 0);
    }
}
