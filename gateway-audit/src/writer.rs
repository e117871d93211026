//! Batch writer flushing audit entries through one transaction per batch.

use std::num::NonZeroUsize;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, warn};

use crate::entry::AuditEntry;
use crate::error::{AuditError, AuditResult};
use crate::store::AuditStore;

/// Default number of entries per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Outcome of one batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Rows inserted and committed.
    pub written: usize,
    /// Rows whose insert failed; the rest of the batch still committed.
    pub failed: usize,
}

/// Accumulates entries and writes them in batches.
///
/// Without a store every operation succeeds without doing anything.
pub struct BatchWriter {
    store: Option<Arc<dyn AuditStore>>,
    batch_size: NonZeroUsize,
    pending: Vec<AuditEntry>,
}

impl BatchWriter {
    /// Creates a writer over the optional store.
    #[must_use]
    pub fn new(store: Option<Arc<dyn AuditStore>>, batch_size: NonZeroUsize) -> Self {
        Self {
            store,
            batch_size,
            pending: Vec::with_capacity(batch_size.get()),
        }
    }

    /// Returns the configured batch size.
    #[must_use]
    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    /// Number of entries waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffers an entry and flushes once the batch is full.
    ///
    /// Flush failures are logged; the batch is discarded either way.
    pub async fn add(&mut self, entry: AuditEntry) {
        self.pending.push(entry);
        if self.pending.len() >= self.batch_size.get() {
            if let Err(err) = self.flush().await {
                error!(error = %err, "failed to write audit batch");
            }
        }
    }

    /// Writes every pending entry.
    ///
    /// An empty flush still opens and commits a transaction.
    ///
    /// # Errors
    ///
    /// Returns the error of [`write`](Self::write); pending entries are dropped.
    pub async fn flush(&mut self) -> AuditResult<WriteReport> {
        let batch = std::mem::take(&mut self.pending);
        self.write(&batch).await
    }

    /// Writes the batch in a single transaction.
    ///
    /// Failing inserts are logged and skipped; the remaining rows commit.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Transaction`] when begin, prepare or commit fails.
    /// Prepare failures roll the batch back.
    pub async fn write(&self, batch: &[AuditEntry]) -> AuditResult<WriteReport> {
        let Some(store) = &self.store else {
            return Ok(WriteReport::default());
        };

        let mut tx = store
            .begin()
            .await
            .map_err(|e| AuditError::transaction(format!("failed to begin audit batch: {e}")))?;

        if let Err(err) = tx.prepare().await {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "audit batch rollback failed");
            }
            counter!("audit_batches_failed_total").increment(1);
            return Err(AuditError::transaction(format!(
                "failed to prepare audit insert: {err}"
            )));
        }

        let mut report = WriteReport::default();
        for entry in batch {
            match tx.insert(entry).await {
                Ok(()) => report.written += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        audit_id = %entry.id(),
                        request_id = %entry.request_id(),
                        error = %err,
                        "failed to insert audit entry"
                    );
                }
            }
        }

        tx.commit().await.map_err(|e| {
            counter!("audit_batches_failed_total").increment(1);
            AuditError::transaction(format!("failed to commit audit batch: {e}"))
        })?;

        counter!("audit_entries_written_total").increment(count(report.written));
        if report.failed > 0 {
            counter!("audit_entries_failed_total").increment(count(report.failed));
        }
        debug!(written = report.written, failed = report.failed, "audit batch committed");
        Ok(report)
    }
}

fn count(rows: usize) -> u64 {
    u64::try_from(rows).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("has_store", &self.store.is_some())
            .field("batch_size", &self.batch_size)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AuditDecision;
    use crate::store::MemoryAuditStore;
    use gateway_primitives::{RequestId, TenantId};

    fn entry(request: &str) -> AuditEntry {
        AuditEntry::builder(
            RequestId::new(request).unwrap(),
            TenantId::new("acme").unwrap(),
            AuditDecision::Allowed,
        )
        .query("hello")
        .build()
    }

    fn writer(store: &MemoryAuditStore, batch: usize) -> BatchWriter {
        BatchWriter::new(
            Some(Arc::new(store.clone()) as Arc<dyn AuditStore>),
            NonZeroUsize::new(batch).unwrap(),
        )
    }

    #[tokio::test]
    async fn failing_rows_are_skipped_and_the_rest_commit() {
        let store = MemoryAuditStore::new();
        store.reject_request("r2").await;
        let writer = writer(&store, 10);

        let report = writer.write(&[entry("r1"), entry("r2"), entry("r3")]).await.unwrap();
        assert_eq!(report, WriteReport { written: 2, failed: 1 });
        assert_eq!(store.entries().await.len(), 2);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn prepare_failure_rolls_back_the_whole_batch() {
        let store = MemoryAuditStore::new();
        store.fail_prepare(true);
        let writer = writer(&store, 10);

        let err = writer.write(&[entry("r1"), entry("r2")]).await.unwrap_err();
        assert!(matches!(err, AuditError::Transaction { .. }));
        assert_eq!(store.rollbacks(), 1);
        assert!(store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn begin_failure_is_one_error() {
        let store = MemoryAuditStore::new();
        store.fail_begin(true);
        let writer = writer(&store, 10);
        assert!(writer.write(&[entry("r1")]).await.is_err());
        assert_eq!(store.begins(), 0);
    }

    #[tokio::test]
    async fn empty_flush_still_commits() {
        let store = MemoryAuditStore::new();
        let mut writer = writer(&store, 10);
        let report = writer.flush().await.unwrap();
        assert_eq!(report, WriteReport::default());
        assert_eq!(store.begins(), 1);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn full_batches_flush_automatically() {
        let store = MemoryAuditStore::new();
        let mut writer = writer(&store, 2);
        writer.add(entry("r1")).await;
        assert_eq!(writer.pending(), 1);
        writer.add(entry("r2")).await;
        assert_eq!(writer.pending(), 0);
        assert_eq!(store.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn missing_store_is_a_no_op() {
        let mut writer = BatchWriter::new(None, NonZeroUsize::new(1).unwrap());
        writer.add(entry("r1")).await;
        assert_eq!(writer.flush().await.unwrap(), WriteReport::default());
    }
}
