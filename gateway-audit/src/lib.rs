//! Asynchronous audit trail for governed requests.
//!
//! Request tasks hand [`AuditEntry`] values to an [`AuditLogger`], which never
//! waits: a full queue drops the entry and counts it. A single [`AuditWorker`]
//! drains the queue into a [`BatchWriter`] that commits one transaction per batch.

#![warn(missing_docs, clippy::pedantic)]

pub mod entry;
mod error;
pub mod journal;
pub mod logger;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod writer;

pub use entry::{
    AuditActor, AuditDecision, AuditEntry, AuditEntryBuilder, ComplianceFlag, PolicyDetails,
    ProviderUsage, QueryComplexity, SecurityMetrics,
};
pub use error::{AuditError, AuditResult};
pub use journal::JournalAuditStore;
pub use logger::{AuditConfig, AuditLogger, AuditWorker, EnqueueOutcome, QueueStats};
#[cfg(feature = "postgres")]
pub use postgres::PostgresAuditStore;
pub use store::{AuditStore, AuditTransaction, MemoryAuditStore, SearchCriteria};
pub use writer::{BatchWriter, WriteReport};
