//! In-memory adapter and connection fakes for engine tests
//!
//! `FakeAdapter` keeps one tiny database per connection label and implements
//! the full adapter contract over it, so analyzer/syncer/orchestrator logic
//! can be exercised without a PostgreSQL server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use dbsync_core::{
    Connection, DatabaseAdapter, DependencyMap, EndpointConfig, QueryResult, Result, Row,
    StatementResult, SyncError, TableMetadata, UniqueConstraint, UpsertOutcome, Value,
};

/// Connection stub: identifies a fake database by label and records executed
/// DDL so schema-refresh tests can script statement failures.
pub struct FakeConnection {
    label: String,
    pub executed: Mutex<Vec<String>>,
    /// (substring, error message): any executed statement containing the
    /// substring fails with the message
    pub fail_execute_containing: Mutex<Vec<(String, String)>>,
}

impl FakeConnection {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            executed: Mutex::new(Vec::new()),
            fail_execute_containing: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_statements_containing(&self, needle: &str, message: &str) {
        self.fail_execute_containing
            .lock()
            .unwrap()
            .push((needle.to_string(), message.to_string()));
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn driver_name(&self) -> &str {
        &self.label
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<StatementResult> {
        self.executed.lock().unwrap().push(sql.to_string());
        for (needle, message) in self.fail_execute_containing.lock().unwrap().iter() {
            if sql.contains(needle.as_str()) {
                return Err(SyncError::Query(message.clone()));
            }
        }
        Ok(StatementResult { affected_rows: 0 })
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        Err(SyncError::Query(format!(
            "FakeConnection has no query support (got: {sql})"
        )))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One in-memory table
#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub pk: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Self-referencing FK column, if any
    pub self_ref: Option<String>,
    pub unique: Vec<UniqueConstraint>,
}

impl FakeTable {
    pub fn with_pk(pk: &str, columns: &[&str]) -> Self {
        Self {
            pk: Some(pk.to_string()),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn push_row(&mut self, values: Vec<Value>) {
        self.rows.push(Row::new(self.columns.clone(), values));
    }

    fn pk_values(&self) -> Vec<Value> {
        let Some(pk) = &self.pk else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.get_by_name(pk).cloned())
            .collect()
    }
}

/// One in-memory database
#[derive(Debug, Default)]
pub struct FakeDb {
    pub tables: BTreeMap<String, FakeTable>,
    pub views: BTreeMap<String, String>,
    pub deps: DependencyMap,
    /// parent table -> (child table -> referencing column)
    pub child_map: BTreeMap<String, BTreeMap<String, String>>,
    /// tables whose COUNT probe should fail
    pub fail_metadata: HashSet<String>,
}

impl FakeDb {
    pub fn add_edge(&mut self, child: &str, parent: &str, fk_column: &str) {
        self.deps
            .entry(child.to_string())
            .or_default()
            .depends_on
            .insert(parent.to_string());
        self.deps
            .entry(parent.to_string())
            .or_default()
            .referenced_by
            .insert(child.to_string());
        if child != parent {
            self.child_map
                .entry(parent.to_string())
                .or_default()
                .insert(child.to_string(), fk_column.to_string());
        }
    }
}

/// Adapter over a set of labelled fake databases
#[derive(Default)]
pub struct FakeAdapter {
    pub dbs: Mutex<HashMap<String, FakeDb>>,
    /// Statements appended to every schema dump, newline-separated
    pub extra_dump_statements: Mutex<Vec<String>>,
    /// pk lookup keys whose upserts should fail
    pub fail_upsert_keys: Mutex<HashSet<String>>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db(self, label: &str, db: FakeDb) -> Self {
        self.dbs.lock().unwrap().insert(label.to_string(), db);
        self
    }

    pub fn edit_db<R>(&self, label: &str, edit: impl FnOnce(&mut FakeDb) -> R) -> R {
        let mut dbs = self.dbs.lock().unwrap();
        edit(dbs.entry(label.to_string()).or_default())
    }

    fn read_table<R>(
        &self,
        conn: &dyn Connection,
        table: &str,
        read: impl FnOnce(&FakeTable) -> R,
    ) -> Result<R> {
        let dbs = self.dbs.lock().unwrap();
        let db = dbs
            .get(conn.driver_name())
            .ok_or_else(|| SyncError::Adapter(format!("no fake db '{}'", conn.driver_name())))?;
        let table = db
            .tables
            .get(table)
            .ok_or_else(|| SyncError::Adapter(format!("no fake table '{table}'")))?;
        Ok(read(table))
    }

    fn edit_table<R>(
        &self,
        conn: &dyn Connection,
        table: &str,
        edit: impl FnOnce(&mut FakeTable) -> R,
    ) -> Result<R> {
        let mut dbs = self.dbs.lock().unwrap();
        let db = dbs
            .get_mut(conn.driver_name())
            .ok_or_else(|| SyncError::Adapter(format!("no fake db '{}'", conn.driver_name())))?;
        let table = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::Adapter(format!("no fake table '{table}'")))?;
        Ok(edit(table))
    }

    /// Writes against a table the DDL replay "created" materialize it here,
    /// since FakeConnection does not interpret CREATE TABLE statements.
    fn ensure_table(&self, conn: &dyn Connection, table: &str, columns: &[String]) {
        let mut dbs = self.dbs.lock().unwrap();
        let db = dbs.entry(conn.driver_name().to_string()).or_default();
        db.tables.entry(table.to_string()).or_insert_with(|| FakeTable {
            pk: columns.iter().find(|c| c.as_str() == "id").cloned(),
            columns: columns.to_vec(),
            ..Default::default()
        });
    }

    pub fn table_rows(&self, label: &str, table: &str) -> Vec<Row> {
        self.dbs.lock().unwrap()[label].tables[table].rows.clone()
    }

    pub fn table_pks(&self, label: &str, table: &str) -> Vec<i64> {
        self.dbs.lock().unwrap()[label].tables[table]
            .pk_values()
            .iter()
            .filter_map(|v| v.as_i64())
            .collect()
    }
}

fn sort_key(value: &Value) -> (i64, String) {
    match value.as_i64() {
        Some(n) => (n, String::new()),
        None => (i64::MAX, value.lookup_key()),
    }
}

#[async_trait]
impl DatabaseAdapter for FakeAdapter {
    async fn foreign_key_dependencies(&self, conn: &dyn Connection) -> Result<DependencyMap> {
        let dbs = self.dbs.lock().unwrap();
        Ok(dbs
            .get(conn.driver_name())
            .map(|db| db.deps.clone())
            .unwrap_or_default())
    }

    async fn child_tables(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<BTreeMap<String, String>> {
        let dbs = self.dbs.lock().unwrap();
        Ok(dbs
            .get(conn.driver_name())
            .and_then(|db| db.child_map.get(table).cloned())
            .unwrap_or_default())
    }

    async fn self_referencing_column(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<String>> {
        self.read_table(conn, table, |t| t.self_ref.clone())
    }

    async fn primary_key_column(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<String>> {
        self.read_table(conn, table, |t| t.pk.clone())
    }

    async fn unique_constraints(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Vec<UniqueConstraint>> {
        self.read_table(conn, table, |t| t.unique.clone())
    }

    async fn reset_sequences(&self, _conn: &dyn Connection) -> Result<usize> {
        Ok(0)
    }

    async fn tables_list(&self, conn: &dyn Connection) -> Result<Vec<String>> {
        let dbs = self.dbs.lock().unwrap();
        Ok(dbs
            .get(conn.driver_name())
            .map(|db| db.tables.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn views_list(&self, conn: &dyn Connection) -> Result<Vec<String>> {
        let dbs = self.dbs.lock().unwrap();
        Ok(dbs
            .get(conn.driver_name())
            .map(|db| db.views.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn table_exists(&self, conn: &dyn Connection, table: &str) -> Result<bool> {
        let dbs = self.dbs.lock().unwrap();
        Ok(dbs
            .get(conn.driver_name())
            .map(|db| db.tables.contains_key(table))
            .unwrap_or(false))
    }

    async fn view_exists(&self, conn: &dyn Connection, view: &str) -> Result<bool> {
        let dbs = self.dbs.lock().unwrap();
        Ok(dbs
            .get(conn.driver_name())
            .map(|db| db.views.contains_key(view))
            .unwrap_or(false))
    }

    async fn table_metadata(&self, conn: &dyn Connection, table: &str) -> TableMetadata {
        let dbs = self.dbs.lock().unwrap();
        let Some(db) = dbs.get(conn.driver_name()) else {
            return TableMetadata {
                error: true,
                ..Default::default()
            };
        };
        if db.fail_metadata.contains(table) {
            return TableMetadata {
                error: true,
                ..Default::default()
            };
        }
        let Some(t) = db.tables.get(table) else {
            return TableMetadata::default();
        };

        let has_updated_at = t.columns.iter().any(|c| c == "updated_at");
        let max_updated_at = if has_updated_at && !t.rows.is_empty() {
            t.rows
                .iter()
                .filter_map(|row| match row.get_by_name("updated_at") {
                    Some(Value::DateTimeUtc(ts)) => Some(*ts),
                    _ => None,
                })
                .max()
        } else {
            None
        };
        let max_id = t
            .rows
            .iter()
            .filter_map(|row| row.get_by_name("id").and_then(|v| v.as_i64()))
            .max();

        TableMetadata {
            count: t.rows.len() as i64,
            has_updated_at,
            max_updated_at,
            max_id,
            error: false,
        }
    }

    async fn has_structure_changed(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        table: &str,
    ) -> bool {
        let dbs = self.dbs.lock().unwrap();
        let source_cols = dbs
            .get(source.driver_name())
            .and_then(|db| db.tables.get(table))
            .map(|t| t.columns.clone());
        let target_cols = dbs
            .get(target.driver_name())
            .and_then(|db| db.tables.get(table))
            .map(|t| t.columns.clone());
        match (source_cols, target_cols) {
            (Some(s), Some(t)) => s != t,
            _ => true,
        }
    }

    async fn has_view_structure_changed(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        view: &str,
    ) -> bool {
        let dbs = self.dbs.lock().unwrap();
        let s = dbs
            .get(source.driver_name())
            .and_then(|db| db.views.get(view).cloned());
        let t = dbs
            .get(target.driver_name())
            .and_then(|db| db.views.get(view).cloned());
        match (s, t) {
            (Some(s), Some(t)) => s != t,
            _ => true,
        }
    }

    async fn drop_table(&self, conn: &dyn Connection, table: &str) -> bool {
        let mut dbs = self.dbs.lock().unwrap();
        if let Some(db) = dbs.get_mut(conn.driver_name()) {
            db.tables.remove(table);
            true
        } else {
            false
        }
    }

    async fn drop_view(&self, conn: &dyn Connection, view: &str) {
        let mut dbs = self.dbs.lock().unwrap();
        if let Some(db) = dbs.get_mut(conn.driver_name()) {
            db.views.remove(view);
        }
    }

    async fn drop_schema(&self, conn: &dyn Connection) -> Result<()> {
        let mut dbs = self.dbs.lock().unwrap();
        if let Some(db) = dbs.get_mut(conn.driver_name()) {
            db.tables.clear();
            db.views.clear();
        }
        Ok(())
    }

    async fn fetch_pk_page(
        &self,
        conn: &dyn Connection,
        table: &str,
        _pk: &str,
        after: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Value>> {
        let after_key = after.map(sort_key);
        self.read_table(conn, table, |t| {
            let mut pks = t.pk_values();
            pks.sort_by_key(sort_key);
            pks.into_iter()
                .filter(|v| match &after_key {
                    Some(a) => sort_key(v) > *a,
                    None => true,
                })
                .take(limit as usize)
                .collect()
        })
    }

    async fn fetch_all_pks(
        &self,
        conn: &dyn Connection,
        table: &str,
        _pk: &str,
    ) -> Result<Vec<Value>> {
        self.read_table(conn, table, |t| t.pk_values())
    }

    async fn fetch_all_rows(&self, conn: &dyn Connection, table: &str) -> Result<Vec<Row>> {
        self.read_table(conn, table, |t| t.rows.clone())
    }

    async fn fetch_page(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
        after: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Row>> {
        let after_key = after.map(sort_key);
        self.read_table(conn, table, |t| {
            let mut rows = t.rows.clone();
            rows.sort_by_key(|row| row.get_by_name(pk).map(sort_key).unwrap_or((i64::MAX, String::new())));
            rows.into_iter()
                .filter(|row| match (&after_key, row.get_by_name(pk)) {
                    (Some(a), Some(v)) => sort_key(v) > *a,
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .take(limit as usize)
                .collect()
        })
    }

    async fn delete_where_in(
        &self,
        conn: &dyn Connection,
        table: &str,
        column: &str,
        ids: &[Value],
    ) -> Result<u64> {
        let keys: HashSet<String> = ids.iter().map(|v| v.lookup_key()).collect();
        self.edit_table(conn, table, |t| {
            let before = t.rows.len();
            t.rows.retain(|row| {
                row.get_by_name(column)
                    .map(|v| !keys.contains(&v.lookup_key()))
                    .unwrap_or(true)
            });
            (before - t.rows.len()) as u64
        })
    }

    async fn find_conflicting_pks(
        &self,
        conn: &dyn Connection,
        table: &str,
        columns: &[String],
        record: &Row,
        pk: &str,
    ) -> Result<Vec<Value>> {
        let Some(record_pk) = record.get_by_name(pk).cloned() else {
            return Ok(Vec::new());
        };
        self.read_table(conn, table, |t| {
            t.rows
                .iter()
                .filter(|row| {
                    let same_tuple = columns.iter().all(|col| {
                        let ours = record.get_by_name(col).unwrap_or(&Value::Null);
                        let theirs = row.get_by_name(col).unwrap_or(&Value::Null);
                        ours.lookup_key() == theirs.lookup_key()
                    });
                    let other_pk = row
                        .get_by_name(pk)
                        .map(|v| v.lookup_key() != record_pk.lookup_key())
                        .unwrap_or(false);
                    same_tuple && other_pk
                })
                .filter_map(|row| row.get_by_name(pk).cloned())
                .collect()
        })
    }

    async fn upsert_record(
        &self,
        conn: &dyn Connection,
        table: &str,
        record: &Row,
        pk: &str,
        _columns: &[String],
    ) -> UpsertOutcome {
        let Some(key) = record.get_by_name(pk).map(|v| v.lookup_key()) else {
            return UpsertOutcome {
                errors: 1,
                ..Default::default()
            };
        };
        if self.fail_upsert_keys.lock().unwrap().contains(&key) {
            return UpsertOutcome {
                errors: 1,
                ..Default::default()
            };
        }

        self.ensure_table(conn, table, record.columns());
        let result = self.edit_table(conn, table, |t| {
            let existing = t.rows.iter_mut().find(|row| {
                row.get_by_name(pk)
                    .map(|v| v.lookup_key() == key)
                    .unwrap_or(false)
            });
            match existing {
                Some(row) => {
                    *row = record.clone();
                    UpsertOutcome {
                        updated: 1,
                        ..Default::default()
                    }
                }
                None => {
                    t.rows.push(record.clone());
                    UpsertOutcome {
                        inserted: 1,
                        ..Default::default()
                    }
                }
            }
        });
        result.unwrap_or(UpsertOutcome {
            errors: 1,
            ..Default::default()
        })
    }

    async fn insert_records(
        &self,
        conn: &dyn Connection,
        table: &str,
        records: &[Row],
    ) -> UpsertOutcome {
        if let Some(first) = records.first() {
            self.ensure_table(conn, table, first.columns());
        }
        let result = self.edit_table(conn, table, |t| {
            t.rows.extend(records.iter().cloned());
            UpsertOutcome {
                inserted: records.len() as u64,
                ..Default::default()
            }
        });
        result.unwrap_or(UpsertOutcome {
            errors: records.len() as u64,
            ..Default::default()
        })
    }

    async fn self_referencing_records(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
        fk: &str,
    ) -> Result<Vec<Row>> {
        self.read_table(conn, table, |t| {
            // assign BFS depths from the roots
            let mut depth_by_key: HashMap<String, i32> = HashMap::new();
            let mut frontier: Vec<String> = t
                .rows
                .iter()
                .filter(|row| row.get_by_name(fk).map(|v| v.is_null()).unwrap_or(true))
                .filter_map(|row| row.get_by_name(pk).map(|v| v.lookup_key()))
                .collect();
            for key in &frontier {
                depth_by_key.insert(key.clone(), 0);
            }
            let mut depth = 0;
            while !frontier.is_empty() {
                depth += 1;
                let parents: HashSet<String> = frontier.drain(..).collect();
                for row in &t.rows {
                    let parent = row.get_by_name(fk).map(|v| v.lookup_key());
                    let own = row.get_by_name(pk).map(|v| v.lookup_key());
                    if let (Some(parent), Some(own)) = (parent, own) {
                        if parents.contains(&parent) && !depth_by_key.contains_key(&own) {
                            depth_by_key.insert(own.clone(), depth);
                            frontier.push(own);
                        }
                    }
                }
            }

            let mut rows: Vec<(i32, (i64, String), Row)> = t
                .rows
                .iter()
                .filter_map(|row| {
                    let own = row.get_by_name(pk)?.lookup_key();
                    let depth = *depth_by_key.get(&own)?;
                    let mut columns: Vec<String> = row.columns().to_vec();
                    let mut values = row.values.clone();
                    columns.push("depth".to_string());
                    values.push(Value::Int32(depth));
                    Some((
                        depth,
                        row.get_by_name(pk).map(sort_key).unwrap(),
                        Row::new(columns, values),
                    ))
                })
                .collect();
            rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
            rows.into_iter().map(|(_, _, row)| row).collect()
        })
    }

    async fn dump_schema(&self, _cfg: &EndpointConfig, tables: &[String]) -> Result<String> {
        if tables.is_empty() {
            return Ok(String::new());
        }
        let mut dump = String::new();
        for table in tables {
            dump.push_str(&format!("CREATE TABLE {table} ();\n"));
            dump.push_str(&format!("CREATE SEQUENCE {table}_id_seq;\n"));
        }
        for statement in self.extra_dump_statements.lock().unwrap().iter() {
            dump.push_str(statement);
            dump.push('\n');
        }
        Ok(dump)
    }

    async fn dump_views_schema(&self, _cfg: &EndpointConfig, views: &[String]) -> Result<String> {
        if views.is_empty() {
            return Ok(String::new());
        }
        let mut dump = String::new();
        for view in views {
            dump.push_str(&format!("CREATE VIEW {view} AS SELECT 1;\n"));
        }
        Ok(dump)
    }

    fn parse_sql_statements(&self, sql: &str) -> Vec<String> {
        sql.lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect()
    }

    async fn create_backup(&self, _cfg: &EndpointConfig, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("db_backup_fake.sql.gz");
        std::fs::create_dir_all(dir)?;
        std::fs::write(&path, b"fake")?;
        Ok(path)
    }

    async fn restore_backup(&self, _cfg: &EndpointConfig, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Endpoint stub for adapter calls that require one
pub fn endpoint() -> EndpointConfig {
    EndpointConfig {
        driver: "postgres".to_string(),
        host: None,
        port: None,
        database: "fake".to_string(),
        username: "fake".to_string(),
        password: None,
        ssl_mode: "prefer".to_string(),
    }
}

/// Convenience: integer id row over the given columns
pub fn row(columns: &[&str], values: Vec<Value>) -> Row {
    Row::new(columns.iter().map(|c| c.to_string()).collect(), values)
}
