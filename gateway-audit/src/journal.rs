//! Audit store appending committed batches to a newline-delimited JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::entry::AuditEntry;
use crate::error::AuditResult;
use crate::store::{AuditStore, AuditTransaction, SearchCriteria};

/// File-backed audit store. A batch becomes visible only once committed.
#[derive(Debug)]
pub struct JournalAuditStore {
    path: PathBuf,
    file: Arc<Mutex<fs::File>>,
}

impl JournalAuditStore {
    /// Opens (or creates) a journal file at the provided path.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors encountered while preparing the file.
    pub async fn open(path: impl Into<PathBuf>) -> AuditResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Returns the underlying path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> AuditResult<Vec<AuditEntry>> {
        let data = fs::read(&self.path).await?;
        let mut entries = Vec::new();
        for (line, chunk) in data
            .split(|byte| *byte == b'\n')
            .filter(|chunk| !chunk.is_empty())
            .enumerate()
        {
            match serde_json::from_slice::<AuditEntry>(chunk) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(path = %self.path.display(), line, error = %err, "skipping unreadable audit line"),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl AuditStore for JournalAuditStore {
    async fn begin(&self) -> AuditResult<Box<dyn AuditTransaction>> {
        Ok(Box::new(JournalTransaction {
            file: Arc::clone(&self.file),
            buffer: Vec::new(),
        }))
    }

    async fn ping(&self) -> AuditResult<()> {
        fs::metadata(&self.path).await?;
        Ok(())
    }

    async fn search(&self, criteria: &SearchCriteria) -> AuditResult<Vec<AuditEntry>> {
        Ok(criteria.select(self.read_all().await?))
    }
}

struct JournalTransaction {
    file: Arc<Mutex<fs::File>>,
    buffer: Vec<u8>,
}

#[async_trait]
impl AuditTransaction for JournalTransaction {
    async fn prepare(&mut self) -> AuditResult<()> {
        Ok(())
    }

    async fn insert(&mut self, entry: &AuditEntry) -> AuditResult<()> {
        let line = serde_json::to_vec(entry)?;
        self.buffer.extend_from_slice(&line);
        self.buffer.push(b'\n');
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AuditResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut guard = self.file.lock().await;
        guard.write_all(&self.buffer).await?;
        guard.flush().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AuditResult<()> {
        Ok(())
    }
}
