//! Per-table data movement: id diffing, ordered deletes, batched upserts

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use dbsync_core::{Connection, DatabaseAdapter, Result, Row, UniqueConstraint, Value};

use crate::progress::SyncProgress;
use crate::retry::{RetryPolicy, retry_read};
use crate::stats::TableStats;

/// Moves rows for one table at a time.
///
/// Remote (source) reads go through the tunnel retry operator; target writes
/// are never retried. The unique-constraint cache lives for one command run.
pub struct DataSyncer<'a> {
    adapter: &'a dyn DatabaseAdapter,
    batch_size: u32,
    retry: RetryPolicy,
    constraints: Mutex<HashMap<String, Arc<Vec<UniqueConstraint>>>>,
}

impl<'a> DataSyncer<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter, batch_size: u32, retry: RetryPolicy) -> Self {
        Self {
            adapter,
            batch_size: batch_size.max(1),
            retry,
            constraints: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the per-run unique-constraint cache (command start)
    pub fn reset_cache(&self) {
        self.constraints.lock().unwrap().clear();
    }

    fn batch(&self) -> usize {
        self.batch_size as usize
    }

    /// Local pk values that no longer exist on the source.
    ///
    /// The remote side is paged in batches; the local side is read in one
    /// query. An empty remote pk set means the table was emptied upstream, so
    /// every local id is returned.
    pub async fn get_ids_to_delete(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        table: &str,
        pk: &str,
    ) -> Result<Vec<Value>> {
        let mut remote_keys: HashSet<String> = HashSet::new();
        let mut after: Option<Value> = None;

        loop {
            let page = retry_read(self.retry, "fetch remote ids", || {
                self.adapter
                    .fetch_pk_page(source, table, pk, after.as_ref(), self.batch_size)
            })
            .await?;

            for value in &page {
                remote_keys.insert(value.lookup_key());
            }
            if page.len() < self.batch() {
                break;
            }
            after = page.last().cloned();
        }

        let local = self.adapter.fetch_all_pks(target, table, pk).await?;
        if remote_keys.is_empty() {
            return Ok(local);
        }
        Ok(local
            .into_iter()
            .filter(|value| !remote_keys.contains(&value.lookup_key()))
            .collect())
    }

    /// Delete `ids` from `table`, clearing referencing child rows first.
    ///
    /// Child deletes are best-effort: children may carry their own FKs, and
    /// anything deeper is picked up by DBMS-level ON DELETE or the cascade
    /// recheck pass.
    pub async fn delete_from_table(
        &self,
        target: &dyn Connection,
        table: &str,
        pk: &str,
        ids: &[Value],
    ) -> TableStats {
        let mut stats = TableStats::default();
        if ids.is_empty() {
            return stats;
        }

        match self.adapter.child_tables(target, table).await {
            Ok(children) => {
                for (child, fk_column) in children {
                    for chunk in ids.chunks(self.batch()) {
                        if let Err(e) = self
                            .adapter
                            .delete_where_in(target, &child, &fk_column, chunk)
                            .await
                        {
                            tracing::warn!(table, child = %child, error = %e, "child delete failed");
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(table, error = %e, "could not enumerate child tables"),
        }

        for chunk in ids.chunks(self.batch()) {
            match self.adapter.delete_where_in(target, table, pk, chunk).await {
                Ok(deleted) => stats.deleted += deleted,
                Err(e) => {
                    tracing::warn!(table, rows = chunk.len(), error = %e, "delete chunk failed");
                    stats.errors += chunk.len() as u64;
                }
            }
        }

        tracing::info!(table, deleted = stats.deleted, errors = stats.errors, "delete phase done");
        stats
    }

    /// Pull every remote row of `table` into the target by upsert.
    ///
    /// Tables without a primary key are skipped (row identity cannot
    /// converge); self-referencing tables take the depth-ordered path.
    pub async fn sync_table_from_remote(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        table: &str,
        progress: &dyn SyncProgress,
    ) -> Result<TableStats> {
        let pk = retry_read(self.retry, "resolve primary key", || {
            self.adapter.primary_key_column(source, table)
        })
        .await?;
        let Some(pk) = pk else {
            tracing::debug!(table, "no primary key; skipping upsert");
            return Ok(TableStats::default());
        };

        let self_ref = retry_read(self.retry, "resolve self reference", || {
            self.adapter.self_referencing_column(source, table)
        })
        .await?;
        if let Some(fk) = self_ref {
            return self
                .sync_self_referencing(source, target, table, &pk, &fk, progress)
                .await;
        }

        let mut stats = TableStats::default();
        let mut after: Option<Value> = None;
        loop {
            let rows = retry_read(self.retry, "fetch remote rows", || {
                self.adapter
                    .fetch_page(source, table, &pk, after.as_ref(), self.batch_size)
            })
            .await?;
            if rows.is_empty() {
                break;
            }

            let last = rows.last().and_then(|row| row.get_by_name(&pk)).cloned();
            stats.merge(
                self.upsert_records(target, table, &rows, Some(&pk), progress)
                    .await?,
            );
            if rows.len() < self.batch() {
                break;
            }
            after = last;
        }

        Ok(stats)
    }

    /// Depth-ordered upsert: every parent row is written before its children,
    /// so no transient FK violation occurs without deferring constraints.
    async fn sync_self_referencing(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        table: &str,
        pk: &str,
        fk: &str,
        progress: &dyn SyncProgress,
    ) -> Result<TableStats> {
        tracing::debug!(table, fk, "self-referencing table; using depth order");
        let rows = retry_read(self.retry, "fetch hierarchy", || {
            self.adapter.self_referencing_records(source, table, pk, fk)
        })
        .await?;

        let stripped: Vec<Row> = rows.iter().map(|row| row.without_column("depth")).collect();

        let mut stats = TableStats::default();
        for chunk in stripped.chunks(self.batch()) {
            stats.merge(
                self.upsert_records(target, table, chunk, Some(pk), progress)
                    .await?,
            );
        }
        Ok(stats)
    }

    /// Plain-insert copy used by `clone`, where the target table is empty.
    pub async fn clone_table_from_remote(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        table: &str,
        progress: &dyn SyncProgress,
    ) -> Result<TableStats> {
        let mut stats = TableStats::default();
        let pk = retry_read(self.retry, "resolve primary key", || {
            self.adapter.primary_key_column(source, table)
        })
        .await?;

        let Some(pk) = pk else {
            let rows = retry_read(self.retry, "fetch remote rows", || {
                self.adapter.fetch_all_rows(source, table)
            })
            .await?;
            for chunk in rows.chunks(self.batch()) {
                let outcome = self.adapter.insert_records(target, table, chunk).await;
                progress.rows_written(table, chunk.len() as u64);
                stats.absorb(outcome);
            }
            return Ok(stats);
        };

        let self_ref = retry_read(self.retry, "resolve self reference", || {
            self.adapter.self_referencing_column(source, table)
        })
        .await?;
        if let Some(fk) = self_ref {
            let rows = retry_read(self.retry, "fetch hierarchy", || {
                self.adapter.self_referencing_records(source, table, &pk, &fk)
            })
            .await?;
            let stripped: Vec<Row> = rows.iter().map(|row| row.without_column("depth")).collect();
            for chunk in stripped.chunks(self.batch()) {
                let outcome = self.adapter.insert_records(target, table, chunk).await;
                progress.rows_written(table, chunk.len() as u64);
                stats.absorb(outcome);
            }
            return Ok(stats);
        }

        let mut after: Option<Value> = None;
        loop {
            let rows = retry_read(self.retry, "fetch remote rows", || {
                self.adapter
                    .fetch_page(source, table, &pk, after.as_ref(), self.batch_size)
            })
            .await?;
            if rows.is_empty() {
                break;
            }
            let last = rows.last().and_then(|row| row.get_by_name(&pk)).cloned();
            let outcome = self.adapter.insert_records(target, table, &rows).await;
            progress.rows_written(table, rows.len() as u64);
            stats.absorb(outcome);
            if rows.len() < self.batch() {
                break;
            }
            after = last;
        }
        Ok(stats)
    }

    /// Write a batch of records to the target.
    ///
    /// Without a primary key (given or discoverable) the batch is inserted
    /// wholesale; otherwise secondary unique-key collisions are cleared first
    /// and rows go through the per-row upsert.
    pub async fn upsert_records(
        &self,
        target: &dyn Connection,
        table: &str,
        records: &[Row],
        pk: Option<&str>,
        progress: &dyn SyncProgress,
    ) -> Result<TableStats> {
        let mut stats = TableStats::default();
        if records.is_empty() {
            return Ok(stats);
        }

        let pk = match pk {
            Some(pk) => Some(pk.to_string()),
            None => self.adapter.primary_key_column(target, table).await?,
        };
        let Some(pk) = pk else {
            let outcome = self.adapter.insert_records(target, table, records).await;
            progress.rows_written(table, records.len() as u64);
            stats.absorb(outcome);
            return Ok(stats);
        };

        self.delete_conflicting_records(target, table, records, &pk)
            .await?;

        let columns = records[0].columns().to_vec();
        for record in records {
            let outcome = self
                .adapter
                .upsert_record(target, table, record, &pk, &columns)
                .await;
            stats.absorb(outcome);
            progress.rows_written(table, 1);
        }
        Ok(stats)
    }

    /// Remove local rows that hold a secondary unique tuple an incoming
    /// record needs but under a different primary key.
    ///
    /// PK-keyed ON CONFLICT cannot resolve those collisions; deleting the
    /// stale holder (and its child rows) lets the remote row land under its
    /// own pk. Constraints whose record values are all NULL are skipped:
    /// NULLs are distinct in unique indexes.
    pub async fn delete_conflicting_records(
        &self,
        target: &dyn Connection,
        table: &str,
        records: &[Row],
        pk: &str,
    ) -> Result<()> {
        let constraints = self.unique_constraints_for(target, table).await?;
        if constraints.is_empty() {
            return Ok(());
        }

        for constraint in constraints.iter() {
            let mut conflicting: Vec<Value> = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();

            for record in records {
                let all_null = constraint.columns.iter().all(|column| {
                    record
                        .get_by_name(column)
                        .map(|value| value.is_null())
                        .unwrap_or(true)
                });
                if all_null {
                    continue;
                }

                let ids = self
                    .adapter
                    .find_conflicting_pks(target, table, &constraint.columns, record, pk)
                    .await?;
                for id in ids {
                    if seen.insert(id.lookup_key()) {
                        conflicting.push(id);
                    }
                }
            }

            if conflicting.is_empty() {
                continue;
            }
            tracing::info!(
                table,
                constraint = %constraint.name,
                rows = conflicting.len(),
                "clearing unique-constraint conflicts"
            );

            if let Ok(children) = self.adapter.child_tables(target, table).await {
                for (child, fk_column) in children {
                    for chunk in conflicting.chunks(self.batch()) {
                        if let Err(e) = self
                            .adapter
                            .delete_where_in(target, &child, &fk_column, chunk)
                            .await
                        {
                            tracing::warn!(table, child = %child, error = %e, "conflict child delete failed");
                        }
                    }
                }
            }
            for chunk in conflicting.chunks(self.batch()) {
                if let Err(e) = self.adapter.delete_where_in(target, table, pk, chunk).await {
                    tracing::warn!(table, error = %e, "conflict delete failed");
                }
            }
        }
        Ok(())
    }

    async fn unique_constraints_for(
        &self,
        target: &dyn Connection,
        table: &str,
    ) -> Result<Arc<Vec<UniqueConstraint>>> {
        if let Some(cached) = self.constraints.lock().unwrap().get(table) {
            return Ok(cached.clone());
        }
        let fetched = Arc::new(self.adapter.unique_constraints(target, table).await?);
        self.constraints
            .lock()
            .unwrap()
            .insert(table.to_string(), fetched.clone());
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::test_support::{FakeAdapter, FakeConnection, FakeDb, FakeTable};

    fn int_rows(table: &mut FakeTable, ids: &[i64]) {
        for id in ids {
            table.push_row(vec![Value::Int64(*id)]);
        }
    }

    fn two_sided(source_ids: &[i64], target_ids: &[i64]) -> FakeAdapter {
        let mut source = FakeDb::default();
        let mut table = FakeTable::with_pk("id", &["id"]);
        int_rows(&mut table, source_ids);
        source.tables.insert("items".to_string(), table);

        let mut target = FakeDb::default();
        let mut table = FakeTable::with_pk("id", &["id"]);
        int_rows(&mut table, target_ids);
        target.tables.insert("items".to_string(), table);

        FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", target)
    }

    fn syncer(adapter: &FakeAdapter) -> DataSyncer<'_> {
        DataSyncer::new(adapter, 2, RetryPolicy::default())
    }

    #[tokio::test]
    async fn ids_to_delete_is_local_minus_remote() {
        let adapter = two_sided(&[1, 2, 4], &[1, 2, 3, 4, 5]);
        let source = FakeConnection::new("source");
        let target = FakeConnection::new("target");

        let ids = syncer(&adapter)
            .get_ids_to_delete(&source, &target, "items", "id")
            .await
            .unwrap();
        let ids: Vec<i64> = ids.iter().filter_map(|v| v.as_i64()).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[tokio::test]
    async fn empty_remote_wipes_all_local_ids() {
        let adapter = two_sided(&[], &[1, 2, 3]);
        let source = FakeConnection::new("source");
        let target = FakeConnection::new("target");

        let ids = syncer(&adapter)
            .get_ids_to_delete(&source, &target, "items", "id")
            .await
            .unwrap();
        let ids: Vec<i64> = ids.iter().filter_map(|v| v.as_i64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn subset_local_means_nothing_to_delete() {
        let adapter = two_sided(&[1, 2, 3, 4], &[2, 3]);
        let source = FakeConnection::new("source");
        let target = FakeConnection::new("target");

        let ids = syncer(&adapter)
            .get_ids_to_delete(&source, &target, "items", "id")
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn delete_clears_children_then_rows() {
        let adapter = two_sided(&[], &[1, 2, 3]);
        adapter.edit_db("target", |db| {
            let mut child = FakeTable::with_pk("id", &["id", "item_id"]);
            child.push_row(vec![Value::Int64(10), Value::Int64(1)]);
            child.push_row(vec![Value::Int64(11), Value::Int64(3)]);
            child.push_row(vec![Value::Int64(12), Value::Int64(2)]);
            db.tables.insert("item_notes".to_string(), child);
            db.add_edge("item_notes", "items", "item_id");
        });
        let target = FakeConnection::new("target");

        let stats = syncer(&adapter)
            .delete_from_table(&target, "items", "id", &[Value::Int64(1), Value::Int64(3)])
            .await;

        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.errors, 0);
        assert_eq!(adapter.table_pks("target", "items"), vec![2]);
        assert_eq!(adapter.table_pks("target", "item_notes"), vec![12]);
    }

    #[tokio::test]
    async fn sync_upserts_new_and_changed_rows() {
        let mut source = FakeDb::default();
        let mut table = FakeTable::with_pk("id", &["id", "name"]);
        table.push_row(vec![Value::Int64(1), Value::String("one".into())]);
        table.push_row(vec![Value::Int64(2), Value::String("two".into())]);
        table.push_row(vec![Value::Int64(3), Value::String("three".into())]);
        source.tables.insert("items".to_string(), table);

        let mut target = FakeDb::default();
        let mut table = FakeTable::with_pk("id", &["id", "name"]);
        table.push_row(vec![Value::Int64(1), Value::String("stale".into())]);
        target.tables.insert("items".to_string(), table);

        let adapter = FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", target);
        let source = FakeConnection::new("source");
        let target = FakeConnection::new("target");

        let stats = syncer(&adapter)
            .sync_table_from_remote(&source, &target, "items", &NoopProgress)
            .await
            .unwrap();

        assert_eq!(stats.updated, 1);
        assert_eq!(stats.inserted, 2);
        let mut pks = adapter.table_pks("target", "items");
        pks.sort();
        assert_eq!(pks, vec![1, 2, 3]);
        let rows = adapter.table_rows("target", "items");
        let one = rows
            .iter()
            .find(|r| r.get_by_name("id") == Some(&Value::Int64(1)))
            .unwrap();
        assert_eq!(one.get_by_name("name"), Some(&Value::String("one".into())));
    }

    #[tokio::test]
    async fn table_without_pk_is_skipped() {
        let mut source = FakeDb::default();
        let mut table = FakeTable::default();
        table.columns = vec!["a".to_string()];
        table.push_row(vec![Value::Int64(1)]);
        source.tables.insert("log".to_string(), table);
        let mut target = FakeDb::default();
        target.tables.insert("log".to_string(), FakeTable::default());

        let adapter = FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", target);
        let stats = syncer(&adapter)
            .sync_table_from_remote(
                &FakeConnection::new("source"),
                &FakeConnection::new("target"),
                "log",
                &NoopProgress,
            )
            .await
            .unwrap();
        assert!(stats.is_empty());
    }

    #[tokio::test]
    async fn self_referencing_rows_arrive_parents_before_children() {
        let mut source = FakeDb::default();
        let mut table = FakeTable::with_pk("id", &["id", "parent_id"]);
        table.self_ref = Some("parent_id".to_string());
        // children listed before their parents on purpose
        table.push_row(vec![Value::Int64(5), Value::Int64(2)]);
        table.push_row(vec![Value::Int64(2), Value::Int64(1)]);
        table.push_row(vec![Value::Int64(1), Value::Null]);
        table.push_row(vec![Value::Int64(9), Value::Null]);
        source.tables.insert("categories".to_string(), table);
        source.add_edge("categories", "categories", "parent_id");

        let mut target = FakeDb::default();
        target.tables.insert(
            "categories".to_string(),
            FakeTable::with_pk("id", &["id", "parent_id"]),
        );

        let adapter = FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", target);
        let stats = syncer(&adapter)
            .sync_table_from_remote(
                &FakeConnection::new("source"),
                &FakeConnection::new("target"),
                "categories",
                &NoopProgress,
            )
            .await
            .unwrap();

        assert_eq!(stats.inserted, 4);
        // insertion order in the fake preserves write order: roots first
        let order = adapter.table_pks("target", "categories");
        assert_eq!(order, vec![1, 9, 2, 5]);
        // depth column was stripped before writing
        let rows = adapter.table_rows("target", "categories");
        assert!(rows.iter().all(|r| r.get_by_name("depth").is_none()));
    }

    #[tokio::test]
    async fn unique_conflict_evicts_stale_holder_and_children() {
        let mut target = FakeDb::default();
        let mut users = FakeTable::with_pk("id", &["id", "email"]);
        users.unique.push(UniqueConstraint {
            name: "users_email_key".to_string(),
            columns: vec!["email".to_string()],
        });
        users.push_row(vec![Value::Int64(1), Value::String("a".into())]);
        target.tables.insert("users".to_string(), users);

        let mut posts = FakeTable::with_pk("id", &["id", "user_id"]);
        posts.push_row(vec![Value::Int64(100), Value::Int64(1)]);
        target.tables.insert("posts".to_string(), posts);
        target.add_edge("posts", "users", "user_id");

        let adapter = FakeAdapter::new().with_db("target", target);
        let target = FakeConnection::new("target");

        let incoming = vec![crate::test_support::row(
            &["id", "email"],
            vec![Value::Int64(2), Value::String("a".into())],
        )];
        let stats = syncer(&adapter)
            .upsert_records(&target, "users", &incoming, Some("id"), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(stats.inserted, 1);
        assert_eq!(adapter.table_pks("target", "users"), vec![2]);
        assert!(adapter.table_pks("target", "posts").is_empty());
    }

    #[tokio::test]
    async fn all_null_unique_tuples_are_not_conflicts() {
        let mut target = FakeDb::default();
        let mut users = FakeTable::with_pk("id", &["id", "email"]);
        users.unique.push(UniqueConstraint {
            name: "users_email_key".to_string(),
            columns: vec!["email".to_string()],
        });
        users.push_row(vec![Value::Int64(1), Value::Null]);
        target.tables.insert("users".to_string(), users);

        let adapter = FakeAdapter::new().with_db("target", target);
        let target = FakeConnection::new("target");

        let incoming = vec![crate::test_support::row(
            &["id", "email"],
            vec![Value::Int64(2), Value::Null],
        )];
        let stats = syncer(&adapter)
            .upsert_records(&target, "users", &incoming, Some("id"), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(stats.inserted, 1);
        let mut pks = adapter.table_pks("target", "users");
        pks.sort();
        assert_eq!(pks, vec![1, 2]);
    }

    #[tokio::test]
    async fn per_row_errors_are_counted_not_fatal() {
        let adapter = two_sided(&[1, 2, 3], &[]);
        adapter
            .fail_upsert_keys
            .lock()
            .unwrap()
            .insert(Value::Int64(2).lookup_key());

        let stats = syncer(&adapter)
            .sync_table_from_remote(
                &FakeConnection::new("source"),
                &FakeConnection::new("target"),
                "items",
                &NoopProgress,
            )
            .await
            .unwrap();

        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.errors, 1);
        let mut pks = adapter.table_pks("target", "items");
        pks.sort();
        assert_eq!(pks, vec![1, 3]);
    }
}
