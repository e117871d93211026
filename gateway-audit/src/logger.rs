//! Non-blocking audit logger and the background worker that drains it.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::entry::AuditEntry;
use crate::error::{AuditError, AuditResult};
use crate::store::{AuditStore, SearchCriteria};
use crate::writer::{BatchWriter, DEFAULT_BATCH_SIZE};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
/// Default periodic flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Queue and batching settings.
#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    capacity: NonZeroUsize,
    batch_size: NonZeroUsize,
    flush_interval: Duration,
}

impl AuditConfig {
    /// Creates a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::InvalidConfig`] for zero capacity, batch size or interval.
    pub fn new(capacity: usize, batch_size: usize, flush_interval: Duration) -> AuditResult<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or(AuditError::InvalidConfig("audit queue capacity must be positive"))?;
        let batch_size = NonZeroUsize::new(batch_size)
            .ok_or(AuditError::InvalidConfig("audit batch size must be positive"))?;
        if flush_interval.is_zero() {
            return Err(AuditError::InvalidConfig("audit flush interval must be positive"));
        }
        Ok(Self {
            capacity,
            batch_size,
            flush_interval,
        })
    }

    /// Returns the queue capacity.
    #[must_use]
    pub const fn capacity(self) -> NonZeroUsize {
        self.capacity
    }

    /// Returns the batch size.
    #[must_use]
    pub const fn batch_size(self) -> NonZeroUsize {
        self.batch_size
    }

    /// Returns the flush interval.
    #[must_use]
    pub const fn flush_interval(self) -> Duration {
        self.flush_interval
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_QUEUE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            batch_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Result of handing an entry to the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The entry is queued for the next batch.
    Enqueued,
    /// The queue was full; the entry was dropped and counted.
    Dropped,
    /// The worker has shut down; the entry was dropped and counted.
    Closed,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries accepted into the queue.
    pub enqueued: u64,
    /// Entries dropped because the queue was full or closed.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Builder for [`AuditLogger`] and its worker.
pub struct AuditLoggerBuilder {
    config: AuditConfig,
    store: Option<Arc<dyn AuditStore>>,
}

impl AuditLoggerBuilder {
    /// Installs the durable store. Without one every write is a no-op.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the logger and the worker that must be spawned to drain it.
    #[must_use]
    pub fn build(self) -> (AuditLogger, AuditWorker) {
        let (sender, receiver) = mpsc::channel(self.config.capacity.get());
        let shutdown = Arc::new(Notify::new());
        let logger = AuditLogger {
            sender,
            counters: Arc::new(Counters::default()),
            store: self.store.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let worker = AuditWorker {
            receiver,
            writer: BatchWriter::new(self.store, self.config.batch_size),
            flush_interval: self.config.flush_interval,
            shutdown,
        };
        (logger, worker)
    }
}

/// Producer handle shared by request tasks.
#[derive(Clone)]
pub struct AuditLogger {
    sender: mpsc::Sender<AuditEntry>,
    counters: Arc<Counters>,
    store: Option<Arc<dyn AuditStore>>,
    shutdown: Arc<Notify>,
}

impl AuditLogger {
    /// Creates a builder.
    #[must_use]
    pub fn builder(config: AuditConfig) -> AuditLoggerBuilder {
        AuditLoggerBuilder {
            config,
            store: None,
        }
    }

    /// Offers an entry to the queue without waiting.
    pub fn enqueue(&self, entry: AuditEntry) -> EnqueueOutcome {
        match self.sender.try_send(entry) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                counter!("audit_entries_enqueued_total").increment(1);
                EnqueueOutcome::Enqueued
            }
            Err(mpsc::error::TrySendError::Full(entry)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("audit_entries_dropped_total", "reason" => "full").increment(1);
                debug!(request_id = %entry.request_id(), "audit queue full, dropping entry");
                EnqueueOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("audit_entries_dropped_total", "reason" => "closed").increment(1);
                warn!(request_id = %entry.request_id(), "audit worker stopped, dropping entry");
                EnqueueOutcome::Closed
            }
        }
    }

    /// Returns the queue counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Returns `true` when no store is configured or the store answers a ping.
    pub async fn is_healthy(&self) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        match time::timeout(PING_TIMEOUT, store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "audit store ping failed");
                false
            }
            Err(_) => {
                warn!("audit store ping timed out");
                false
            }
        }
    }

    /// Searches persisted entries; empty without a store.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn search(&self, criteria: &SearchCriteria) -> AuditResult<Vec<AuditEntry>> {
        match &self.store {
            Some(store) => store.search(criteria).await,
            None => Ok(Vec::new()),
        }
    }

    /// Asks the worker to flush what it has and stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("stats", &self.stats())
            .field("has_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

/// Single consumer draining the queue into the batch writer.
pub struct AuditWorker {
    receiver: mpsc::Receiver<AuditEntry>,
    writer: BatchWriter,
    flush_interval: Duration,
    shutdown: Arc<Notify>,
}

impl AuditWorker {
    /// Spawns the worker on the current runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until shutdown is requested or every logger handle is dropped,
    /// then drains the queue and performs a final flush.
    pub async fn run(mut self) {
        let mut ticker = time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(batch_size = self.writer.batch_size().get(), "audit worker started");

        loop {
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Some(entry) => self.writer.add(entry).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush("periodic").await,
                () = self.shutdown.notified() => {
                    self.receiver.close();
                    while let Some(entry) = self.receiver.recv().await {
                        self.writer.add(entry).await;
                    }
                    break;
                }
            }
        }

        self.flush("final").await;
        info!("audit worker stopped");
    }

    async fn flush(&mut self, trigger: &'static str) {
        if let Err(err) = self.writer.flush().await {
            error!(trigger, error = %err, "failed to flush audit batch");
        }
    }
}

impl std::fmt::Debug for AuditWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWorker")
            .field("writer", &self.writer)
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}
