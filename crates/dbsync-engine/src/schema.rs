//! Schema refresh: detect structurally divergent objects and rebuild them
//! from source-dumped DDL

use dbsync_core::{Connection, DatabaseAdapter, EndpointConfig, Result};

use crate::graph::{DependencyGraph, SortDirection};

/// Tables and views partitioned by why they need a rebuild
#[derive(Debug, Clone, Default)]
pub struct RefreshSets {
    /// Present on the source, absent on the target
    pub missing_tables: Vec<String>,
    /// Present on both but structurally different
    pub changed_tables: Vec<String>,
    pub missing_views: Vec<String>,
    pub changed_views: Vec<String>,
}

impl RefreshSets {
    pub fn is_empty(&self) -> bool {
        self.missing_tables.is_empty()
            && self.changed_tables.is_empty()
            && self.missing_views.is_empty()
            && self.changed_views.is_empty()
    }

    /// All tables needing a rebuild (missing first, then changed)
    pub fn tables(&self) -> Vec<String> {
        self.missing_tables
            .iter()
            .chain(self.changed_tables.iter())
            .cloned()
            .collect()
    }

    pub fn views(&self) -> Vec<String> {
        self.missing_views
            .iter()
            .chain(self.changed_views.iter())
            .cloned()
            .collect()
    }
}

/// Per-statement outcome counters for one refresh run.
///
/// A skipped FK is a constraint whose referenced table is deliberately or
/// transitively outside the refresh scope; the count lets the caller widen
/// scope on a later run instead of silently losing the constraint.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    pub created_tables: usize,
    pub created_sequences: usize,
    pub created_constraints: usize,
    pub skipped_fk: usize,
    pub errors: Vec<String>,
}

impl RefreshOutcome {
    pub fn merge(&mut self, other: RefreshOutcome) {
        self.created_tables += other.created_tables;
        self.created_sequences += other.created_sequences;
        self.created_constraints += other.created_constraints;
        self.skipped_fk += other.skipped_fk;
        self.errors.extend(other.errors);
    }
}

/// Detects and executes structure rebuilds
pub struct SchemaManager<'a> {
    adapter: &'a dyn DatabaseAdapter,
}

impl<'a> SchemaManager<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter) -> Self {
        Self { adapter }
    }

    /// Partition the given source objects into missing and changed on the
    /// target.
    pub async fn find_tables_needing_refresh(
        &self,
        source: &dyn Connection,
        target: &dyn Connection,
        remote_tables: &[String],
        remote_views: &[String],
    ) -> Result<RefreshSets> {
        let mut sets = RefreshSets::default();

        for table in remote_tables {
            if !self.adapter.table_exists(target, table).await? {
                sets.missing_tables.push(table.clone());
            } else if self.adapter.has_structure_changed(source, target, table).await {
                sets.changed_tables.push(table.clone());
            }
        }

        for view in remote_views {
            if !self.adapter.view_exists(target, view).await? {
                sets.missing_views.push(view.clone());
            } else if self
                .adapter
                .has_view_structure_changed(source, target, view)
                .await
            {
                sets.changed_views.push(view.clone());
            }
        }

        tracing::debug!(
            missing_tables = sets.missing_tables.len(),
            changed_tables = sets.changed_tables.len(),
            missing_views = sets.missing_views.len(),
            changed_views = sets.changed_views.len(),
            "computed refresh sets"
        );
        Ok(sets)
    }

    /// Drop and recreate `tables` (children-first drop, parents-first
    /// create) and `views` from source-dumped DDL.
    ///
    /// No statement failure aborts the refresh: FK statements whose target
    /// is out of scope count as skipped, everything else lands in `errors`.
    pub async fn refresh_tables_structure(
        &self,
        target: &dyn Connection,
        source_cfg: &EndpointConfig,
        graph: &DependencyGraph,
        tables: &[String],
        views: &[String],
    ) -> Result<RefreshOutcome> {
        let mut outcome = RefreshOutcome::default();

        if !tables.is_empty() {
            let drop_order = graph.sort(tables, SortDirection::ChildrenFirst);
            for table in &drop_order {
                self.adapter.drop_table(target, table).await;
            }

            let create_order = graph.sort(tables, SortDirection::ParentsFirst);
            let dump = self.adapter.dump_schema(source_cfg, &create_order).await?;

            for statement in self.adapter.parse_sql_statements(&dump) {
                match target.execute(&statement, &[]).await {
                    Ok(_) => {
                        if statement.contains("CREATE TABLE") {
                            outcome.created_tables += 1;
                        } else if statement.contains("CREATE SEQUENCE") {
                            outcome.created_sequences += 1;
                        } else if statement.contains("ADD CONSTRAINT") {
                            outcome.created_constraints += 1;
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        if statement.contains("FOREIGN KEY") && message.contains("does not exist") {
                            tracing::debug!(
                                statement = %statement.chars().take(120).collect::<String>(),
                                "skipping FK to out-of-scope table"
                            );
                            outcome.skipped_fk += 1;
                        } else {
                            tracing::warn!(error = %message, "schema statement failed");
                            outcome.errors.push(message);
                        }
                    }
                }
            }
        }

        if !views.is_empty() {
            for view in views {
                self.adapter.drop_view(target, view).await;
            }
            let dump = self.adapter.dump_views_schema(source_cfg, views).await?;
            for statement in self.adapter.parse_sql_statements(&dump) {
                if let Err(e) = target.execute(&statement, &[]).await {
                    tracing::warn!(error = %e, "view statement failed");
                    outcome.errors.push(format!("VIEW: {e}"));
                }
            }
        }

        tracing::info!(
            created_tables = outcome.created_tables,
            created_sequences = outcome.created_sequences,
            created_constraints = outcome.created_constraints,
            skipped_fk = outcome.skipped_fk,
            errors = outcome.errors.len(),
            "schema refresh done"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeAdapter, FakeConnection, FakeDb, FakeTable, endpoint};
    use dbsync_core::DependencyMap;

    fn empty_graph() -> DependencyGraph {
        DependencyGraph::new(DependencyMap::new())
    }

    #[tokio::test]
    async fn partitions_missing_and_changed() {
        let mut source = FakeDb::default();
        source
            .tables
            .insert("users".to_string(), FakeTable::with_pk("id", &["id", "name"]));
        source
            .tables
            .insert("orders".to_string(), FakeTable::with_pk("id", &["id"]));
        source
            .views
            .insert("user_names".to_string(), "SELECT name FROM users".to_string());

        let mut target = FakeDb::default();
        // same structure
        target
            .tables
            .insert("orders".to_string(), FakeTable::with_pk("id", &["id"]));
        // users missing entirely; view present but different
        target
            .views
            .insert("user_names".to_string(), "SELECT id FROM users".to_string());

        let adapter = FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", target);
        let manager = SchemaManager::new(&adapter);
        let sets = manager
            .find_tables_needing_refresh(
                &FakeConnection::new("source"),
                &FakeConnection::new("target"),
                &["orders".to_string(), "users".to_string()],
                &["user_names".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(sets.missing_tables, vec!["users".to_string()]);
        assert!(sets.changed_tables.is_empty());
        assert!(sets.missing_views.is_empty());
        assert_eq!(sets.changed_views, vec!["user_names".to_string()]);
    }

    #[tokio::test]
    async fn changed_structure_is_detected() {
        let mut source = FakeDb::default();
        source.tables.insert(
            "users".to_string(),
            FakeTable::with_pk("id", &["id", "name", "email"]),
        );
        let mut target = FakeDb::default();
        target
            .tables
            .insert("users".to_string(), FakeTable::with_pk("id", &["id", "name"]));

        let adapter = FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", target);
        let manager = SchemaManager::new(&adapter);
        let sets = manager
            .find_tables_needing_refresh(
                &FakeConnection::new("source"),
                &FakeConnection::new("target"),
                &["users".to_string()],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(sets.changed_tables, vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn refresh_counts_statement_classes() {
        let mut source = FakeDb::default();
        source
            .tables
            .insert("orders".to_string(), FakeTable::with_pk("id", &["id"]));
        let adapter = FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", FakeDb::default());

        let target = FakeConnection::new("target");
        let manager = SchemaManager::new(&adapter);
        let outcome = manager
            .refresh_tables_structure(
                &target,
                &endpoint(),
                &empty_graph(),
                &["orders".to_string()],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(outcome.created_tables, 1);
        assert_eq!(outcome.created_sequences, 1);
        assert_eq!(outcome.skipped_fk, 0);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn fk_to_out_of_scope_table_is_skipped_not_an_error() {
        let mut source = FakeDb::default();
        source
            .tables
            .insert("orders".to_string(), FakeTable::with_pk("id", &["id"]));
        let adapter = FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", FakeDb::default());
        adapter.extra_dump_statements.lock().unwrap().push(
            "ALTER TABLE ONLY orders ADD CONSTRAINT orders_user_id_fk FOREIGN KEY (user_id) REFERENCES users(id);".to_string(),
        );

        let target = FakeConnection::new("target");
        target.fail_statements_containing(
            "FOREIGN KEY (user_id)",
            "relation \"users\" does not exist",
        );

        let manager = SchemaManager::new(&adapter);
        let outcome = manager
            .refresh_tables_structure(
                &target,
                &endpoint(),
                &empty_graph(),
                &["orders".to_string()],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(outcome.created_tables, 1);
        assert_eq!(outcome.skipped_fk, 1);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn non_fk_failures_are_collected_and_do_not_abort() {
        let mut source = FakeDb::default();
        source
            .tables
            .insert("orders".to_string(), FakeTable::with_pk("id", &["id"]));
        source
            .tables
            .insert("users".to_string(), FakeTable::with_pk("id", &["id"]));
        let adapter = FakeAdapter::new()
            .with_db("source", source)
            .with_db("target", FakeDb::default());

        let target = FakeConnection::new("target");
        target.fail_statements_containing("CREATE SEQUENCE orders_id_seq", "permission denied");

        let manager = SchemaManager::new(&adapter);
        let outcome = manager
            .refresh_tables_structure(
                &target,
                &endpoint(),
                &empty_graph(),
                &["orders".to_string(), "users".to_string()],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(outcome.created_tables, 2);
        assert_eq!(outcome.created_sequences, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("permission denied"));
    }

    #[tokio::test]
    async fn view_errors_carry_view_prefix() {
        let adapter = FakeAdapter::new()
            .with_db("source", FakeDb::default())
            .with_db("target", FakeDb::default());

        let target = FakeConnection::new("target");
        target.fail_statements_containing("CREATE VIEW broken_view", "division by zero");

        let manager = SchemaManager::new(&adapter);
        let outcome = manager
            .refresh_tables_structure(
                &target,
                &endpoint(),
                &empty_graph(),
                &[],
                &["broken_view".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("VIEW: "));
    }
}
