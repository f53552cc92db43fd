//! Per-table differential analysis and sync planning

use std::collections::BTreeSet;

use dbsync_core::{Connection, DatabaseAdapter, Result, Value};

use crate::graph::DependencyGraph;
use crate::retry::{RetryPolicy, retry_read};
use crate::schema::RefreshSets;
use crate::syncer::DataSyncer;

/// What the analyzer found out about one table
#[derive(Debug, Clone, Default)]
pub struct TableDiff {
    pub table: String,
    /// Primary key column on the source, when present
    pub pk: Option<String>,
    pub needs_sync: bool,
    pub local_count: i64,
    pub remote_count: i64,
    /// Both sides expose `updated_at` and the maxima differ
    pub has_updates: bool,
    /// Local pk values absent from the source
    pub ids_to_delete: Vec<Value>,
    /// A metadata probe failed on either side
    pub metadata_error: bool,
    /// The schema manager will drop and recreate this table; its rows then
    /// describe a full reload
    pub refreshed: bool,
    /// Added by parent closure, not by a detected difference
    pub is_parent: bool,
    /// Added by the cascade recheck pass
    pub is_child: bool,
}

impl TableDiff {
    /// Whether this entry justifies touching the target during the sync
    /// phases.
    pub fn is_actionable(&self) -> bool {
        self.refreshed
            || !self.ids_to_delete.is_empty()
            || self.local_count != self.remote_count
            || self.has_updates
            || self.is_parent
            || self.is_child
    }
}

/// Everything a pull decided to do, before execution
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub tables_to_sync: Vec<TableDiff>,
    /// Subset of the plan that gets dropped and recreated
    pub tables_to_refresh: Vec<String>,
    pub views_to_refresh: Vec<String>,
    pub missing_tables: Vec<String>,
    pub changed_tables: Vec<String>,
    pub missing_views: Vec<String>,
    pub changed_views: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.tables_to_sync.is_empty() && self.views_to_refresh.is_empty()
    }

    /// Entries worth executing (see `TableDiff::is_actionable`)
    pub fn actionable(&self) -> Vec<TableDiff> {
        self.tables_to_sync
            .iter()
            .filter(|diff| diff.is_actionable())
            .cloned()
            .collect()
    }
}

/// Computes per-table diffs and assembles the sync plan
pub struct Analyzer<'a> {
    adapter: &'a dyn DatabaseAdapter,
    syncer: &'a DataSyncer<'a>,
    retry: RetryPolicy,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        adapter: &'a dyn DatabaseAdapter,
        syncer: &'a DataSyncer<'a>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            adapter,
            syncer,
            retry,
        }
    }

    /// Diff every table in `tables` between source and target
    pub async fn analyze(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        tables: &[String],
    ) -> Result<Vec<TableDiff>> {
        let mut diffs = Vec::with_capacity(tables.len());
        for table in tables {
            let diff = self.analyze_table(source, target, table).await?;
            tracing::debug!(
                table,
                needs_sync = diff.needs_sync,
                local = diff.local_count,
                remote = diff.remote_count,
                deletes = diff.ids_to_delete.len(),
                "analyzed table"
            );
            diffs.push(diff);
        }
        Ok(diffs)
    }

    async fn analyze_table(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        table: &str,
    ) -> Result<TableDiff> {
        let local = self.adapter.table_metadata(target, table).await;
        let remote = self.adapter.table_metadata(source, table).await;

        let mut diff = TableDiff {
            table: table.to_string(),
            local_count: local.count,
            remote_count: remote.count,
            ..Default::default()
        };

        // a table we cannot probe is a table we cannot prove converged
        if local.error || remote.error {
            diff.needs_sync = true;
            diff.metadata_error = true;
            return Ok(diff);
        }

        diff.pk = retry_read(self.retry, "resolve primary key", || {
            self.adapter.primary_key_column(source, table)
        })
        .await?;

        if let Some(pk) = diff.pk.clone() {
            if local.count > 0 {
                diff.ids_to_delete = self
                    .syncer
                    .get_ids_to_delete(source, target, table, &pk)
                    .await?;
            }
        }

        diff.needs_sync = !diff.ids_to_delete.is_empty()
            || remote.count != local.count
            || remote.max_id != local.max_id;

        if local.has_updated_at
            && remote.has_updated_at
            && local.max_updated_at != remote.max_updated_at
        {
            diff.needs_sync = true;
            diff.has_updates = true;
        }

        Ok(diff)
    }
}

/// Assemble the plan: keep diffs that need syncing, mark refresh targets,
/// and close over FK parents so referenced rows land before referencing
/// ones even when `--tables` narrowed the scope.
pub fn build_plan(
    diffs: Vec<TableDiff>,
    refresh: &RefreshSets,
    graph: &DependencyGraph,
    excluded: &BTreeSet<String>,
) -> SyncPlan {
    let refresh_tables: BTreeSet<&String> = refresh
        .missing_tables
        .iter()
        .chain(refresh.changed_tables.iter())
        .collect();

    let mut tables_to_sync: Vec<TableDiff> =
        diffs.into_iter().filter(|diff| diff.needs_sync).collect();
    for diff in &mut tables_to_sync {
        if refresh_tables.contains(&diff.table) {
            diff.refreshed = true;
        }
    }

    // transitive parent closure
    let mut included: BTreeSet<String> = tables_to_sync
        .iter()
        .map(|diff| diff.table.clone())
        .collect();
    let mut worklist: Vec<String> = included.iter().cloned().collect();
    while let Some(table) = worklist.pop() {
        for parent in graph.parents_of(&table) {
            if parent == &table || included.contains(parent) || excluded.contains(parent) {
                continue;
            }
            included.insert(parent.clone());
            tables_to_sync.push(TableDiff {
                table: parent.clone(),
                is_parent: true,
                ..Default::default()
            });
            worklist.push(parent.clone());
        }
    }

    let tables_to_refresh: Vec<String> = tables_to_sync
        .iter()
        .filter(|diff| diff.refreshed)
        .map(|diff| diff.table.clone())
        .collect();
    let views_to_refresh: Vec<String> = refresh
        .missing_views
        .iter()
        .chain(refresh.changed_views.iter())
        .cloned()
        .collect();

    SyncPlan {
        tables_to_sync,
        tables_to_refresh,
        views_to_refresh,
        missing_tables: refresh.missing_tables.clone(),
        changed_tables: refresh.changed_tables.clone(),
        missing_views: refresh.missing_views.clone(),
        changed_views: refresh.changed_views.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::test_support::{FakeAdapter, FakeConnection, FakeDb, FakeTable};
    use dbsync_core::DependencyMap;
    use dbsync_core::TableDependencies;

    fn adapter_with(source: FakeDb, target: FakeDb) -> FakeAdapter {
        FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", target)
    }

    fn items_db(ids: &[i64]) -> FakeDb {
        let mut db = FakeDb::default();
        let mut table = FakeTable::with_pk("id", &["id"]);
        for id in ids {
            table.push_row(vec![Value::Int64(*id)]);
        }
        db.tables.insert("items".to_string(), table);
        db
    }

    async fn diff_items(adapter: &FakeAdapter) -> TableDiff {
        let syncer = DataSyncer::new(adapter, 100, RetryPolicy::default());
        let analyzer = Analyzer::new(adapter, &syncer, RetryPolicy::default());
        let diffs = analyzer
            .analyze(
                &FakeConnection::new("source"),
                &FakeConnection::new("target"),
                &["items".to_string()],
            )
            .await
            .unwrap();
        diffs.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn identical_tables_need_no_sync() {
        let adapter = adapter_with(items_db(&[1, 2, 3]), items_db(&[1, 2, 3]));
        let diff = diff_items(&adapter).await;
        assert!(!diff.needs_sync);
        assert!(diff.ids_to_delete.is_empty());
    }

    #[tokio::test]
    async fn count_difference_triggers_sync() {
        let adapter = adapter_with(items_db(&[1, 2, 3]), items_db(&[1, 2]));
        let diff = diff_items(&adapter).await;
        assert!(diff.needs_sync);
        assert_eq!(diff.remote_count, 3);
        assert_eq!(diff.local_count, 2);
    }

    #[tokio::test]
    async fn stale_local_ids_trigger_sync_and_deletes() {
        let adapter = adapter_with(items_db(&[1, 2]), items_db(&[1, 2, 9]));
        let diff = diff_items(&adapter).await;
        assert!(diff.needs_sync);
        let ids: Vec<i64> = diff.ids_to_delete.iter().filter_map(|v| v.as_i64()).collect();
        assert_eq!(ids, vec![9]);
    }

    #[tokio::test]
    async fn metadata_error_marks_table_for_sync() {
        let mut target = items_db(&[1]);
        target.fail_metadata.insert("items".to_string());
        let adapter = adapter_with(items_db(&[1]), target);
        let diff = diff_items(&adapter).await;
        assert!(diff.needs_sync);
        assert!(diff.metadata_error);
        assert!(diff.ids_to_delete.is_empty());
    }

    #[tokio::test]
    async fn updated_at_difference_sets_has_updates() {
        use chrono::{TimeZone, Utc};
        let mut source = FakeDb::default();
        let mut table = FakeTable::with_pk("id", &["id", "updated_at"]);
        table.push_row(vec![
            Value::Int64(1),
            Value::DateTimeUtc(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()),
        ]);
        source.tables.insert("items".to_string(), table);

        let mut target = FakeDb::default();
        let mut table = FakeTable::with_pk("id", &["id", "updated_at"]);
        table.push_row(vec![
            Value::Int64(1),
            Value::DateTimeUtc(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()),
        ]);
        target.tables.insert("items".to_string(), table);

        let adapter = adapter_with(source, target);
        let diff = diff_items(&adapter).await;
        assert!(diff.needs_sync);
        assert!(diff.has_updates);
    }

    fn graph_of(edges: &[(&str, &str)]) -> DependencyGraph {
        let mut map = DependencyMap::new();
        for (child, parent) in edges {
            map.entry(child.to_string())
                .or_insert_with(TableDependencies::default)
                .depends_on
                .insert(parent.to_string());
            map.entry(parent.to_string())
                .or_insert_with(TableDependencies::default)
                .referenced_by
                .insert(child.to_string());
        }
        DependencyGraph::new(map)
    }

    #[test]
    fn plan_closes_over_parents_transitively() {
        let graph = graph_of(&[("order_items", "orders"), ("orders", "users")]);
        let diffs = vec![TableDiff {
            table: "order_items".to_string(),
            needs_sync: true,
            ..Default::default()
        }];
        let plan = build_plan(diffs, &RefreshSets::default(), &graph, &BTreeSet::new());

        let names: Vec<&str> = plan.tables_to_sync.iter().map(|d| d.table.as_str()).collect();
        assert!(names.contains(&"order_items"));
        assert!(names.contains(&"orders"));
        assert!(names.contains(&"users"));
        assert!(
            plan.tables_to_sync
                .iter()
                .filter(|d| d.table != "order_items")
                .all(|d| d.is_parent)
        );
    }

    #[test]
    fn excluded_tables_stay_out_of_the_closure() {
        let graph = graph_of(&[("orders", "users")]);
        let diffs = vec![TableDiff {
            table: "orders".to_string(),
            needs_sync: true,
            ..Default::default()
        }];
        let excluded: BTreeSet<String> = ["users".to_string()].into();
        let plan = build_plan(diffs, &RefreshSets::default(), &graph, &excluded);
        assert_eq!(plan.tables_to_sync.len(), 1);
    }

    #[test]
    fn refresh_set_marks_diffs_and_plan_lists_them() {
        let graph = DependencyGraph::new(DependencyMap::new());
        let diffs = vec![
            TableDiff {
                table: "orders".to_string(),
                needs_sync: true,
                ..Default::default()
            },
            TableDiff {
                table: "users".to_string(),
                needs_sync: true,
                ..Default::default()
            },
        ];
        let refresh = RefreshSets {
            missing_tables: vec!["orders".to_string()],
            ..Default::default()
        };
        let plan = build_plan(diffs, &refresh, &graph, &BTreeSet::new());

        assert_eq!(plan.tables_to_refresh, vec!["orders".to_string()]);
        let orders = plan
            .tables_to_sync
            .iter()
            .find(|d| d.table == "orders")
            .unwrap();
        assert!(orders.refreshed);
    }

    #[test]
    fn actionable_filters_unactionable_entries() {
        let plan = SyncPlan {
            tables_to_sync: vec![
                TableDiff {
                    table: "equal_counts_metadata_error".to_string(),
                    needs_sync: true,
                    metadata_error: true,
                    ..Default::default()
                },
                TableDiff {
                    table: "count_mismatch".to_string(),
                    needs_sync: true,
                    local_count: 1,
                    remote_count: 2,
                    ..Default::default()
                },
                TableDiff {
                    table: "closure_parent".to_string(),
                    is_parent: true,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let actionable = plan.actionable();
        let names: Vec<&str> = actionable.iter().map(|d| d.table.as_str()).collect();
        assert_eq!(names, vec!["count_mismatch", "closure_parent"]);
    }
}
