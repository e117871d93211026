//! Concurrency-limited task spawning for governed requests.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

const DEFAULT_MAX_CONCURRENCY: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(limit) => limit,
    None => NonZeroUsize::MIN,
};

/// Maximum number of requests processed at once.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    max_concurrency: NonZeroUsize,
}

impl SchedulerConfig {
    /// Creates a configuration with the supplied concurrency limit.
    #[must_use]
    pub const fn new(max_concurrency: NonZeroUsize) -> Self {
        Self { max_concurrency }
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub const fn max_concurrency(self) -> NonZeroUsize {
        self.max_concurrency
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

/// Runs each request on its own task, at most `max_concurrency` at a time.
///
/// A spawned request keeps running when the caller stops waiting on its
/// handle, so audit and metrics side effects still happen.
#[derive(Debug, Clone)]
pub struct RequestScheduler {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    config: SchedulerConfig,
}

impl RequestScheduler {
    /// Constructs a scheduler using the provided configuration.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency().get())),
            closed: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Returns the associated configuration.
    #[must_use]
    pub const fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Returns `true` if the scheduler has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Permits not currently held by a running request.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Closes the scheduler. Queued requests that have not started yet
    /// resolve to [`SchedulerError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    /// Spawns a future once a concurrency permit is available.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] when the scheduler is closed before
    /// the task is enqueued. The handle yields the same error when it closes
    /// while the task waits for a permit.
    pub fn spawn<F, T>(&self, future: F) -> SchedulerResult<JoinHandle<SchedulerResult<T>>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let semaphore = Arc::clone(&self.semaphore);
        Ok(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| SchedulerError::Closed)?;
            Ok(future.await)
        }))
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Errors produced by the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Scheduler is closed and will not accept new requests.
    #[error("scheduler closed")]
    Closed,
    /// The spawned task panicked or was aborted.
    #[error("request task failed: {0}")]
    Join(String),
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
