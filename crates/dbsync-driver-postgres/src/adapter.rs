//! PostgreSQL implementation of the `DatabaseAdapter` contract

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use dbsync_core::{
    Connection, DatabaseAdapter, DependencyMap, EndpointConfig, Result, Row, SyncError,
    TableMetadata, UniqueConstraint, UpsertOutcome, Value,
};

use crate::dump;
use crate::sql::{literal, literal_list, quote_ident};
use crate::statements;

const SCHEMA: &str = "public";

/// Stateless adapter: all per-run state (graph, constraint caches) lives in
/// the engine.
#[derive(Debug, Default)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn column_structure(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Vec<(String, String, String, String)>> {
        let result = conn
            .query(
                "SELECT column_name, data_type, udt_name, is_nullable
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[Value::String(SCHEMA.to_string()), Value::String(table.to_string())],
            )
            .await?;

        Ok(result
            .rows
            .iter()
            .map(|row| {
                (
                    text(row.get(0)),
                    text(row.get(1)),
                    text(row.get(2)),
                    text(row.get(3)),
                )
            })
            .collect())
    }

    async fn view_definition(&self, conn: &dyn Connection, view: &str) -> Result<Option<String>> {
        let result = conn
            .query(
                "SELECT view_definition
                 FROM information_schema.views
                 WHERE table_schema = $1 AND table_name = $2",
                &[Value::String(SCHEMA.to_string()), Value::String(view.to_string())],
            )
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(|v| v.as_str())
            .map(normalize_definition))
    }

    async fn has_column(&self, conn: &dyn Connection, table: &str, column: &str) -> Result<bool> {
        let result = conn
            .query(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.columns
                     WHERE table_schema = $1 AND table_name = $2 AND column_name = $3
                 )",
                &[
                    Value::String(SCHEMA.to_string()),
                    Value::String(table.to_string()),
                    Value::String(column.to_string()),
                ],
            )
            .await?;
        Ok(result.scalar().and_then(|v| v.as_bool()).unwrap_or(false))
    }
}

fn text(value: Option<&Value>) -> String {
    value.and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

/// Collapse whitespace runs so cosmetic reformatting does not read as a
/// structural change.
fn normalize_definition(definition: &str) -> String {
    definition
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .to_string()
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    #[tracing::instrument(skip(self, conn))]
    async fn foreign_key_dependencies(&self, conn: &dyn Connection) -> Result<DependencyMap> {
        let result = conn
            .query(
                "SELECT tc.table_name, ccu.table_name AS foreign_table_name
                 FROM information_schema.table_constraints AS tc
                 JOIN information_schema.constraint_column_usage AS ccu
                   ON ccu.constraint_name = tc.constraint_name
                   AND ccu.table_schema = tc.table_schema
                 WHERE tc.constraint_type = 'FOREIGN KEY'
                   AND tc.table_schema = $1",
                &[Value::String(SCHEMA.to_string())],
            )
            .await?;

        let mut graph = DependencyMap::new();
        for row in &result.rows {
            let table = text(row.get(0));
            let references = text(row.get(1));
            if table.is_empty() || references.is_empty() {
                continue;
            }
            graph.entry(table.clone()).or_default().depends_on.insert(references.clone());
            graph.entry(references).or_default().referenced_by.insert(table);
        }

        tracing::debug!(tables = graph.len(), "built FK dependency graph");
        Ok(graph)
    }

    #[tracing::instrument(skip(self, conn))]
    async fn child_tables(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<BTreeMap<String, String>> {
        let result = conn
            .query(
                "SELECT tc.table_name, kcu.column_name
                 FROM information_schema.table_constraints AS tc
                 JOIN information_schema.key_column_usage AS kcu
                   ON tc.constraint_name = kcu.constraint_name
                   AND tc.table_schema = kcu.table_schema
                 JOIN information_schema.constraint_column_usage AS ccu
                   ON ccu.constraint_name = tc.constraint_name
                   AND ccu.table_schema = tc.table_schema
                 WHERE tc.constraint_type = 'FOREIGN KEY'
                   AND tc.table_schema = $1
                   AND ccu.table_name = $2
                   AND tc.table_name <> $2
                 ORDER BY tc.table_name, tc.constraint_name",
                &[Value::String(SCHEMA.to_string()), Value::String(table.to_string())],
            )
            .await?;

        let mut children = BTreeMap::new();
        for row in &result.rows {
            let child = text(row.get(0));
            let column = text(row.get(1));
            children.entry(child).or_insert(column);
        }
        Ok(children)
    }

    async fn self_referencing_column(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<String>> {
        let result = conn
            .query(
                "SELECT kcu.column_name
                 FROM information_schema.table_constraints AS tc
                 JOIN information_schema.key_column_usage AS kcu
                   ON tc.constraint_name = kcu.constraint_name
                   AND tc.table_schema = kcu.table_schema
                 JOIN information_schema.constraint_column_usage AS ccu
                   ON ccu.constraint_name = tc.constraint_name
                   AND ccu.table_schema = tc.table_schema
                 WHERE tc.constraint_type = 'FOREIGN KEY'
                   AND tc.table_schema = $1
                   AND tc.table_name = $2
                   AND ccu.table_name = $2
                 ORDER BY tc.constraint_name
                 LIMIT 1",
                &[Value::String(SCHEMA.to_string()), Value::String(table.to_string())],
            )
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    async fn primary_key_column(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<String>> {
        let result = conn
            .query(
                "SELECT kcu.column_name
                 FROM information_schema.table_constraints tc
                 JOIN information_schema.key_column_usage kcu
                   ON tc.constraint_name = kcu.constraint_name
                   AND tc.table_schema = kcu.table_schema
                 WHERE tc.constraint_type = 'PRIMARY KEY'
                   AND tc.table_schema = $1
                   AND tc.table_name = $2
                 ORDER BY kcu.ordinal_position
                 LIMIT 1",
                &[Value::String(SCHEMA.to_string()), Value::String(table.to_string())],
            )
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    async fn unique_constraints(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Vec<UniqueConstraint>> {
        let result = conn
            .query(
                "SELECT tc.constraint_name,
                        array_agg(kcu.column_name::text ORDER BY kcu.ordinal_position) AS columns
                 FROM information_schema.table_constraints tc
                 JOIN information_schema.key_column_usage kcu
                   ON tc.constraint_name = kcu.constraint_name
                   AND tc.table_schema = kcu.table_schema
                 WHERE tc.constraint_type = 'UNIQUE'
                   AND tc.table_schema = $1
                   AND tc.table_name = $2
                 GROUP BY tc.constraint_name
                 ORDER BY tc.constraint_name",
                &[Value::String(SCHEMA.to_string()), Value::String(table.to_string())],
            )
            .await?;

        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.get(0).and_then(|v| v.as_str())?.to_string();
                let columns = row.get(1).and_then(|v| v.as_string_array())?;
                Some(UniqueConstraint { name, columns })
            })
            .collect())
    }

    #[tracing::instrument(skip(self, conn))]
    async fn reset_sequences(&self, conn: &dyn Connection) -> Result<usize> {
        let result = conn
            .query(
                "SELECT c.table_name,
                        c.column_name,
                        pg_get_serial_sequence(quote_ident(c.table_name), c.column_name)::text
                 FROM information_schema.columns c
                 WHERE c.table_schema = $1
                   AND c.column_default LIKE 'nextval(%'
                 ORDER BY c.table_name, c.column_name",
                &[Value::String(SCHEMA.to_string())],
            )
            .await?;

        let mut succeeded = 0;
        for row in &result.rows {
            let table = text(row.get(0));
            let column = text(row.get(1));
            let sequence = text(row.get(2));
            if sequence.is_empty() {
                continue;
            }

            let sql = format!(
                "SELECT setval('{}', COALESCE(MAX({col}), 1), MAX({col}) IS NOT NULL) FROM {}",
                sequence.replace('\'', "''"),
                quote_ident(&table),
                col = quote_ident(&column),
            );
            match conn.query(&sql, &[]).await {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    tracing::warn!(sequence = %sequence, error = %e, "failed to reset sequence")
                }
            }
        }

        tracing::debug!(succeeded, "sequences reset");
        Ok(succeeded)
    }

    async fn tables_list(&self, conn: &dyn Connection) -> Result<Vec<String>> {
        let result = conn
            .query(
                "SELECT table_name
                 FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[Value::String(SCHEMA.to_string())],
            )
            .await?;
        Ok(result.rows.iter().map(|row| text(row.get(0))).collect())
    }

    async fn views_list(&self, conn: &dyn Connection) -> Result<Vec<String>> {
        let result = conn
            .query(
                "SELECT table_name
                 FROM information_schema.views
                 WHERE table_schema = $1
                 ORDER BY table_name",
                &[Value::String(SCHEMA.to_string())],
            )
            .await?;
        Ok(result.rows.iter().map(|row| text(row.get(0))).collect())
    }

    async fn table_exists(&self, conn: &dyn Connection, table: &str) -> Result<bool> {
        let result = conn
            .query(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.tables
                     WHERE table_schema = $1 AND table_name = $2 AND table_type = 'BASE TABLE'
                 )",
                &[Value::String(SCHEMA.to_string()), Value::String(table.to_string())],
            )
            .await?;
        Ok(result.scalar().and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn view_exists(&self, conn: &dyn Connection, view: &str) -> Result<bool> {
        let result = conn
            .query(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.views
                     WHERE table_schema = $1 AND table_name = $2
                 )",
                &[Value::String(SCHEMA.to_string()), Value::String(view.to_string())],
            )
            .await?;
        Ok(result.scalar().and_then(|v| v.as_bool()).unwrap_or(false))
    }

    #[tracing::instrument(skip(self, conn))]
    async fn table_metadata(&self, conn: &dyn Connection, table: &str) -> TableMetadata {
        let mut metadata = TableMetadata::default();

        let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        match conn.query(&count_sql, &[]).await {
            Ok(result) => {
                metadata.count = result.scalar().and_then(|v| v.as_i64()).unwrap_or(0);
            }
            Err(e) => {
                tracing::warn!(table, error = %e, "count probe failed");
                metadata.error = true;
                return metadata;
            }
        }

        metadata.has_updated_at = self
            .has_column(conn, table, "updated_at")
            .await
            .unwrap_or(false);
        if metadata.has_updated_at && metadata.count > 0 {
            let sql = format!("SELECT MAX(updated_at) FROM {}", quote_ident(table));
            if let Ok(result) = conn.query(&sql, &[]).await {
                metadata.max_updated_at = result.scalar().and_then(|v| match v {
                    Value::DateTimeUtc(ts) => Some(*ts),
                    Value::DateTime(ts) => Some(ts.and_utc()),
                    _ => None,
                });
            }
        }

        if self.has_column(conn, table, "id").await.unwrap_or(false) {
            let sql = format!("SELECT MAX(id) FROM {}", quote_ident(table));
            if let Ok(result) = conn.query(&sql, &[]).await {
                metadata.max_id = result.scalar().and_then(|v| v.as_i64());
            }
        }

        metadata
    }

    async fn has_structure_changed(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        table: &str,
    ) -> bool {
        let (source_columns, target_columns) = match (
            self.column_structure(source, table).await,
            self.column_structure(target, table).await,
        ) {
            (Ok(s), Ok(t)) => (s, t),
            // cannot prove equality, so rebuild
            _ => return true,
        };

        if source_columns.len() != target_columns.len() {
            return true;
        }

        for (name, data_type, udt_name, is_nullable) in &source_columns {
            match target_columns.iter().find(|(n, ..)| n == name) {
                Some((_, t_type, t_udt, t_nullable)) => {
                    if data_type != t_type || udt_name != t_udt || is_nullable != t_nullable {
                        return true;
                    }
                }
                None => return true,
            }
        }

        false
    }

    async fn has_view_structure_changed(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        view: &str,
    ) -> bool {
        match (
            self.view_definition(source, view).await,
            self.view_definition(target, view).await,
        ) {
            (Ok(s), Ok(t)) => s != t,
            _ => true,
        }
    }

    async fn drop_table(&self, conn: &dyn Connection, table: &str) -> bool {
        let sql = format!("DROP TABLE IF EXISTS {} CASCADE", quote_ident(table));
        match conn.execute(&sql, &[]).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(table, error = %e, "failed to drop table");
                false
            }
        }
    }

    async fn drop_view(&self, conn: &dyn Connection, view: &str) {
        let sql = format!("DROP VIEW IF EXISTS {} CASCADE", quote_ident(view));
        if let Err(e) = conn.execute(&sql, &[]).await {
            tracing::warn!(view, error = %e, "failed to drop view");
        }
    }

    async fn drop_schema(&self, conn: &dyn Connection) -> Result<()> {
        for sql in [
            "DROP SCHEMA public CASCADE",
            "CREATE SCHEMA public",
            "GRANT ALL ON SCHEMA public TO PUBLIC",
        ] {
            conn.execute(sql, &[])
                .await
                .map_err(|e| SyncError::Adapter(format!("{sql}: {e}")))?;
        }
        Ok(())
    }

    async fn fetch_pk_page(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
        after: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Value>> {
        let predicate = match after {
            Some(value) => format!(" WHERE {} > {}", quote_ident(pk), literal(value)),
            None => String::new(),
        };
        let sql = format!(
            "SELECT {pk} FROM {table}{predicate} ORDER BY {pk} LIMIT {limit}",
            pk = quote_ident(pk),
            table = quote_ident(table),
        );
        let result = conn.query(&sql, &[]).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.get(0).cloned())
            .collect())
    }

    async fn fetch_all_pks(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
    ) -> Result<Vec<Value>> {
        let sql = format!(
            "SELECT {pk} FROM {table}",
            pk = quote_ident(pk),
            table = quote_ident(table)
        );
        let result = conn.query(&sql, &[]).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.get(0).cloned())
            .collect())
    }

    async fn fetch_all_rows(&self, conn: &dyn Connection, table: &str) -> Result<Vec<Row>> {
        let sql = format!("SELECT * FROM {}", quote_ident(table));
        let result = conn.query(&sql, &[]).await?;
        Ok(result.rows)
    }

    async fn fetch_page(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
        after: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Row>> {
        let predicate = match after {
            Some(value) => format!(" WHERE {} > {}", quote_ident(pk), literal(value)),
            None => String::new(),
        };
        let sql = format!(
            "SELECT * FROM {table}{predicate} ORDER BY {pk} LIMIT {limit}",
            table = quote_ident(table),
            pk = quote_ident(pk),
        );
        let result = conn.query(&sql, &[]).await?;
        Ok(result.rows)
    }

    async fn delete_where_in(
        &self,
        conn: &dyn Connection,
        table: &str,
        column: &str,
        ids: &[Value],
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_ident(table),
            quote_ident(column),
            literal_list(ids)
        );
        let result = conn.execute(&sql, &[]).await?;
        Ok(result.affected_rows)
    }

    async fn find_conflicting_pks(
        &self,
        conn: &dyn Connection,
        table: &str,
        columns: &[String],
        record: &Row,
        pk: &str,
    ) -> Result<Vec<Value>> {
        let Some(record_pk) = record.get_by_name(pk) else {
            return Ok(Vec::new());
        };

        let mut conditions = Vec::with_capacity(columns.len() + 1);
        for column in columns {
            let value = record.get_by_name(column).unwrap_or(&Value::Null);
            if value.is_null() {
                conditions.push(format!("{} IS NULL", quote_ident(column)));
            } else {
                conditions.push(format!("{} = {}", quote_ident(column), literal(value)));
            }
        }
        conditions.push(format!("{} <> {}", quote_ident(pk), literal(record_pk)));

        let sql = format!(
            "SELECT {pk} FROM {table} WHERE {cond}",
            pk = quote_ident(pk),
            table = quote_ident(table),
            cond = conditions.join(" AND "),
        );
        let result = conn.query(&sql, &[]).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.get(0).cloned())
            .collect())
    }

    async fn upsert_record(
        &self,
        conn: &dyn Connection,
        table: &str,
        record: &Row,
        pk: &str,
        columns: &[String],
    ) -> UpsertOutcome {
        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let value_list: Vec<String> = columns
            .iter()
            .map(|c| literal(record.get_by_name(c).unwrap_or(&Value::Null)))
            .collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| c.as_str() != pk)
            .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
            .collect();

        let conflict_action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = format!(
            "INSERT INTO {table} ({cols}) VALUES ({vals}) ON CONFLICT ({pk}) {action}",
            table = quote_ident(table),
            cols = column_list.join(", "),
            vals = value_list.join(", "),
            pk = quote_ident(pk),
            action = conflict_action,
        );

        match conn.execute(&sql, &[]).await {
            // affected-rows as a change-class hint: the driver reports 1 for
            // both paths, so this splits conservatively rather than exactly
            Ok(result) if result.affected_rows > 0 => UpsertOutcome {
                updated: 1,
                ..Default::default()
            },
            Ok(_) => UpsertOutcome {
                inserted: 1,
                ..Default::default()
            },
            Err(e) => {
                tracing::warn!(table, error = %e, "row upsert failed");
                UpsertOutcome {
                    errors: 1,
                    ..Default::default()
                }
            }
        }
    }

    async fn insert_records(
        &self,
        conn: &dyn Connection,
        table: &str,
        records: &[Row],
    ) -> UpsertOutcome {
        let Some(first) = records.first() else {
            return UpsertOutcome::default();
        };

        let columns = first.columns().to_vec();
        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let tuples: Vec<String> = records
            .iter()
            .map(|record| {
                let values: Vec<String> = columns
                    .iter()
                    .map(|c| literal(record.get_by_name(c).unwrap_or(&Value::Null)))
                    .collect();
                format!("({})", values.join(", "))
            })
            .collect();

        let sql = format!(
            "INSERT INTO {table} ({cols}) VALUES {tuples}",
            table = quote_ident(table),
            cols = column_list.join(", "),
            tuples = tuples.join(", "),
        );

        match conn.execute(&sql, &[]).await {
            Ok(_) => UpsertOutcome {
                inserted: records.len() as u64,
                ..Default::default()
            },
            Err(e) => {
                tracing::warn!(table, rows = records.len(), error = %e, "batch insert failed");
                UpsertOutcome {
                    errors: records.len() as u64,
                    ..Default::default()
                }
            }
        }
    }

    async fn self_referencing_records(
        &self,
        conn: &dyn Connection,
        table: &str,
        pk: &str,
        fk: &str,
    ) -> Result<Vec<Row>> {
        let sql = format!(
            "WITH RECURSIVE hierarchy AS (
                 SELECT base.*, 0 AS depth
                 FROM {table} base
                 WHERE base.{fk} IS NULL
                 UNION ALL
                 SELECT child.*, hierarchy.depth + 1
                 FROM {table} child
                 JOIN hierarchy ON child.{fk} = hierarchy.{pk}
             )
             SELECT * FROM hierarchy ORDER BY depth, {pk}",
            table = quote_ident(table),
            pk = quote_ident(pk),
            fk = quote_ident(fk),
        );
        let result = conn.query(&sql, &[]).await?;
        Ok(result.rows)
    }

    async fn dump_schema(&self, cfg: &EndpointConfig, tables: &[String]) -> Result<String> {
        dump::dump_schema_objects(cfg, tables).await
    }

    async fn dump_views_schema(&self, cfg: &EndpointConfig, views: &[String]) -> Result<String> {
        dump::dump_schema_objects(cfg, views).await
    }

    fn parse_sql_statements(&self, sql: &str) -> Vec<String> {
        statements::parse_sql_statements(sql)
    }

    async fn create_backup(&self, cfg: &EndpointConfig, dir: &Path) -> Result<PathBuf> {
        dump::create_backup(cfg, dir).await
    }

    async fn restore_backup(&self, cfg: &EndpointConfig, path: &Path) -> Result<()> {
        dump::restore_backup(cfg, path).await
    }
}
