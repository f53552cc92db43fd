//! DBMS adapter contract
//!
//! `DatabaseAdapter` collects every DBMS-specific primitive the sync engine
//! needs: catalog introspection, structure comparison, schema dump/restore
//! through the native tools, row paging, and upsert rendering. The engine
//! itself never writes SQL; it sequences calls into this contract.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Connection, EndpointConfig, Result, Row, Value};

/// Foreign-key neighborhood of a single table.
///
/// For every edge `a -> b` recorded in `a.depends_on`, the reverse edge
/// appears in `b.referenced_by`. Self-loops are recorded but never traversed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDependencies {
    /// Tables this table references via FK (its parents)
    pub depends_on: BTreeSet<String>,
    /// Tables referencing this table via FK (its children)
    pub referenced_by: BTreeSet<String>,
}

/// Full bidirectional FK graph of the synced schema, keyed by table name
pub type DependencyMap = BTreeMap<String, TableDependencies>;

/// Probe results for one table, used by the analyzer to decide whether the
/// table diverged.
#[derive(Debug, Clone, Default)]
pub struct TableMetadata {
    /// Row count; 0 when the count probe failed
    pub count: i64,
    /// Whether the table exposes an `updated_at` column
    pub has_updated_at: bool,
    /// Maximum `updated_at`, read only when the column exists and the table
    /// is non-empty
    pub max_updated_at: Option<DateTime<Utc>>,
    /// Maximum of a column literally named `id`; absence is not an error
    pub max_id: Option<i64>,
    /// True iff the primary COUNT(*) probe failed
    pub error: bool,
}

/// A unique constraint on the target table (primary key excluded)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    /// Constrained columns, in constraint order
    pub columns: Vec<String>,
}

/// Per-row outcome counters for upsert and insert operations.
///
/// The inserted/updated split follows the driver's affected-rows report and
/// is a change-class hint rather than an exact census; errors are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub errors: u64,
}

impl UpsertOutcome {
    pub fn merge(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.errors += other.errors;
    }

    pub fn total_written(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// DBMS-specific synchronization primitives.
///
/// Connection-bound operations take `&dyn Connection`; operations that shell
/// out to the DBMS native tools take the endpoint configuration instead.
/// Unless documented otherwise, failures surface as `SyncError::Adapter`.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    // --- catalog introspection ---

    /// Read all FK constraints in the synced schema and return the full
    /// bidirectional graph.
    async fn foreign_key_dependencies(&self, conn: &dyn Connection) -> Result<DependencyMap>;

    /// Tables holding an FK into `table`, mapped to the referencing column.
    /// Excludes `table` itself even when self-referencing.
    async fn child_tables(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<BTreeMap<String, String>>;

    /// The first FK column on `table` whose referenced table is `table`
    /// itself, if any.
    async fn self_referencing_column(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<String>>;

    /// Primary key column of `table`, if any
    async fn primary_key_column(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<String>>;

    /// Unique constraints on `table`, excluding the primary key
    async fn unique_constraints(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Vec<UniqueConstraint>>;

    /// For every column whose default is backed by a sequence, set the
    /// sequence to `max(column)` (or 1 when the table is empty). Continues
    /// past per-sequence failures; returns how many succeeded.
    async fn reset_sequences(&self, conn: &dyn Connection) -> Result<usize>;

    /// Base tables in the synced schema
    async fn tables_list(&self, conn: &dyn Connection) -> Result<Vec<String>>;

    /// Views in the synced schema
    async fn views_list(&self, conn: &dyn Connection) -> Result<Vec<String>>;

    async fn table_exists(&self, conn: &dyn Connection, table: &str) -> Result<bool>;

    async fn view_exists(&self, conn: &dyn Connection, view: &str) -> Result<bool>;

    // --- metadata & structure comparison ---

    /// Probe count / max id / max updated_at for one table. A failed COUNT
    /// collapses to `error: true`; a missing `id` column does not.
    async fn table_metadata(&self, conn: &dyn Connection, table: &str) -> TableMetadata;

    /// Compare column structure by ordinal position: same column count and
    /// identical (data_type, udt_name, is_nullable) per column name. Any
    /// probe error reports *changed* (the safe side).
    async fn has_structure_changed(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        table: &str,
    ) -> bool;

    /// Compare normalized view definitions; probe errors report *changed*.
    async fn has_view_structure_changed(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        view: &str,
    ) -> bool;

    // --- destructive DDL ---

    /// DROP TABLE ... CASCADE; errors are swallowed to `false`
    async fn drop_table(&self, conn: &dyn Connection, table: &str) -> bool;

    /// DROP VIEW ... CASCADE; errors are swallowed
    async fn drop_view(&self, conn: &dyn Connection, view: &str);

    /// Drop and recreate the synced schema, restoring default grants
    async fn drop_schema(&self, conn: &dyn Connection) -> Result<()>;

    // --- row movement ---

    /// Keyset page of primary-key values: `pk > after` (or the first page
    /// when `after` is None), ordered by pk, at most `limit` rows.
    async fn fetch_pk_page(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
        after: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Value>>;

    /// All primary-key values of `table`, in table order
    async fn fetch_all_pks(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
    ) -> Result<Vec<Value>>;

    /// Every row of `table`, in table order. Used by the clone path for
    /// tables without a primary key, where keyset paging is impossible.
    async fn fetch_all_rows(&self, conn: &dyn Connection, table: &str) -> Result<Vec<Row>>;

    /// Keyset page of full rows ordered by pk
    async fn fetch_page(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
        after: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Row>>;

    /// `DELETE FROM table WHERE column IN (ids...)`; returns rows deleted
    async fn delete_where_in(
        &self,
        conn: &dyn Connection,
        table: &str,
        column: &str,
        ids: &[Value],
    ) -> Result<u64>;

    /// Primary keys of rows whose `columns` equal the corresponding values in
    /// `record` (NULLs matched with IS NULL) but whose pk differs from the
    /// record's. Used to clear secondary-unique-key collisions before upsert.
    async fn find_conflicting_pks(
        &self,
        conn: &dyn Connection,
        table: &str,
        columns: &[String],
        record: &Row,
        pk: &str,
    ) -> Result<Vec<Value>>;

    /// Single-row upsert keyed on `pk`: insert with ON CONFLICT DO UPDATE
    /// over every non-pk column. Per-row errors land in `errors`, never in
    /// `Err`.
    async fn upsert_record(
        &self,
        conn: &dyn Connection,
        table: &str,
        record: &Row,
        pk: &str,
        columns: &[String],
    ) -> UpsertOutcome;

    /// Plain batch INSERT for tables without a primary key (and for clone
    /// into an empty target). A failed batch counts every row as an error.
    async fn insert_records(
        &self,
        conn: &dyn Connection,
        table: &str,
        records: &[Row],
    ) -> UpsertOutcome;

    /// All rows of a self-referencing table ordered by recursion depth (roots
    /// first, `fk IS NULL` as roots), tie-broken by pk. Rows carry an
    /// auxiliary `depth` column that callers strip before writing.
    async fn self_referencing_records(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
        fk: &str,
    ) -> Result<Vec<Row>>;

    // --- schema dump / backup (native tools) ---

    /// Schema-only dump of `tables`, owner/ACL stripped. Empty list returns
    /// an empty string without invoking the tool.
    async fn dump_schema(&self, cfg: &EndpointConfig, tables: &[String]) -> Result<String>;

    /// Schema-only dump restricted to `views`
    async fn dump_views_schema(&self, cfg: &EndpointConfig, views: &[String]) -> Result<String>;

    /// Split a schema dump into executable statements: blank lines, comment
    /// lines, session-level SET statements and configuration-function calls
    /// are dropped; continuation lines are joined until a line ends with `;`.
    fn parse_sql_statements(&self, sql: &str) -> Vec<String>;

    /// Write a compressed full dump of the endpoint into `dir`; returns the
    /// backup file path.
    async fn create_backup(&self, cfg: &EndpointConfig, dir: &Path) -> Result<PathBuf>;

    /// Feed a compressed dump back into the endpoint. Fails with
    /// `SyncError::Restore` when the client reports a real error (`ERROR:`
    /// without `already exists`).
    async fn restore_backup(&self, cfg: &EndpointConfig, path: &Path) -> Result<()>;
}
