//! dbsync synchronization engine
//!
//! Drives one-way convergence of a local target database onto a remote
//! source: FK dependency ordering, per-table differential analysis, schema
//! refresh through dumped DDL, ordered delete/upsert phases, cascade
//! recheck, and backup lifecycle.

mod analyzer;
mod backup;
mod graph;
mod orchestrator;
mod progress;
mod retry;
mod schema;
mod stats;
mod syncer;

#[cfg(test)]
pub(crate) mod test_support;

pub use analyzer::{Analyzer, SyncPlan, TableDiff};
pub use backup::{BackupInfo, BackupManager};
pub use graph::{DependencyGraph, GraphCache, SortDirection};
pub use orchestrator::{CloneOutcome, Orchestrator, PullOutcome, SyncOptions};
pub use progress::{NoopProgress, SyncProgress};
pub use retry::{RetryPolicy, retry_read};
pub use schema::{RefreshOutcome, RefreshSets, SchemaManager};
pub use stats::{SyncReport, TableStats};
pub use syncer::DataSyncer;
