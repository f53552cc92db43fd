//! Progress reporting seam
//!
//! The engine reports row movement through this trait; the CLI renders it
//! with progress bars. Reporting serializes with the work (the engine is
//! strictly sequential), so implementations need no internal ordering.

/// Observer for per-table sync progress
pub trait SyncProgress: Send + Sync {
    /// A table's upsert or insert pass is starting. `total_rows` is the
    /// remote count when known.
    fn table_started(&self, _table: &str, _total_rows: Option<u64>) {}

    /// `rows` more rows were written to the target
    fn rows_written(&self, _table: &str, _rows: u64) {}

    /// The table's pass finished
    fn table_finished(&self, _table: &str) {}
}

/// Silent observer used by tests and non-interactive runs
#[derive(Debug, Default)]
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
