//! FK dependency graph and topological ordering

use std::collections::HashSet;
use std::collections::BTreeSet;
use std::sync::Arc;

use dbsync_core::{Connection, DatabaseAdapter, DependencyMap, Result};

/// Which end of the FK edges a sort should put first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Referenced tables before the tables referencing them
    ParentsFirst,
    /// Referencing tables before the tables they reference
    ChildrenFirst,
}

/// Immutable FK graph of the synced schema.
///
/// Built once per command run from the source database and shared read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    map: DependencyMap,
    empty: BTreeSet<String>,
}

impl DependencyGraph {
    pub fn new(map: DependencyMap) -> Self {
        Self {
            map,
            empty: BTreeSet::new(),
        }
    }

    /// Tables `table` references (its parents)
    pub fn parents_of(&self, table: &str) -> &BTreeSet<String> {
        self.map
            .get(table)
            .map(|deps| &deps.depends_on)
            .unwrap_or(&self.empty)
    }

    /// Tables referencing `table` (its children)
    pub fn children_of(&self, table: &str) -> &BTreeSet<String> {
        self.map
            .get(table)
            .map(|deps| &deps.referenced_by)
            .unwrap_or(&self.empty)
    }

    /// Linearize `tables` so that FK prerequisites come first.
    ///
    /// Depth-first post-order bounded to the input set. Neighbors outside the
    /// input, already emitted, or currently on the visit stack are skipped;
    /// the latter is what makes genuine FK cycles (and self-loops) terminate
    /// instead of erroring. The result is a permutation of the input and is
    /// deterministic for a given input order.
    pub fn sort(&self, tables: &[String], direction: SortDirection) -> Vec<String> {
        let input: HashSet<&str> = tables.iter().map(|t| t.as_str()).collect();
        let mut visited: HashSet<&str> = HashSet::with_capacity(tables.len());
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut output = Vec::with_capacity(tables.len());

        for table in tables {
            self.visit(table, direction, &input, &mut visited, &mut on_stack, &mut output);
        }

        output
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        direction: SortDirection,
        input: &HashSet<&str>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        output: &mut Vec<String>,
    ) {
        if visited.contains(node) || on_stack.contains(node) {
            return;
        }
        on_stack.insert(node);

        let neighbors = match direction {
            SortDirection::ParentsFirst => self.parents_of(node),
            SortDirection::ChildrenFirst => self.children_of(node),
        };
        for neighbor in neighbors {
            if input.contains(neighbor.as_str()) {
                self.visit(neighbor, direction, input, visited, on_stack, output);
            }
        }

        on_stack.remove(node);
        visited.insert(node);
        output.push(node.to_string());
    }
}

/// Once-per-run memoization of the graph build
#[derive(Debug, Default)]
pub struct GraphCache {
    cached: Option<Arc<DependencyGraph>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from the source database, reusing a previous build
    /// within the same run.
    pub async fn build(
        &mut self,
        adapter: &dyn DatabaseAdapter,
        conn: &dyn Connection,
    ) -> Result<Arc<DependencyGraph>> {
        if let Some(graph) = &self.cached {
            return Ok(graph.clone());
        }
        let map = adapter.foreign_key_dependencies(conn).await?;
        let graph = Arc::new(DependencyGraph::new(map));
        self.cached = Some(graph.clone());
        Ok(graph)
    }

    pub fn reset(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbsync_core::TableDependencies;
    use pretty_assertions::assert_eq;

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

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn index_of(order: &[String], name: &str) -> usize {
        order.iter().position(|t| t == name).unwrap()
    }

    fn shop_graph() -> DependencyGraph {
        graph_of(&[
            ("orders", "users"),
            ("orders", "products"),
            ("products", "categories"),
            ("order_items", "orders"),
            ("order_items", "products"),
            ("reviews", "users"),
        ])
    }

    #[test]
    fn parents_first_orders_prerequisites_before_dependents() {
        let graph = shop_graph();
        let input = names(&[
            "order_items",
            "orders",
            "users",
            "products",
            "categories",
            "reviews",
        ]);
        let order = graph.sort(&input, SortDirection::ParentsFirst);

        assert_eq!(order.len(), input.len());
        for table in &input {
            assert!(order.contains(table));
        }
        assert!(index_of(&order, "users") < index_of(&order, "orders"));
        assert!(index_of(&order, "categories") < index_of(&order, "products"));
        assert!(index_of(&order, "orders") < index_of(&order, "order_items"));
        assert!(index_of(&order, "products") < index_of(&order, "order_items"));
    }

    #[test]
    fn children_first_reverses_parents_first() {
        let graph = shop_graph();
        let input = names(&["order_items", "orders", "users", "products", "categories"]);
        let order = graph.sort(&input, SortDirection::ChildrenFirst);

        assert!(index_of(&order, "order_items") < index_of(&order, "orders"));
        assert!(index_of(&order, "orders") < index_of(&order, "users"));
        assert!(index_of(&order, "products") < index_of(&order, "categories"));
    }

    #[test]
    fn self_loop_terminates_without_duplicates() {
        let graph = graph_of(&[("categories", "categories"), ("products", "categories")]);
        let order = graph.sort(
            &names(&["products", "categories"]),
            SortDirection::ParentsFirst,
        );
        assert_eq!(order, names(&["categories", "products"]));
    }

    #[test]
    fn cycle_is_tolerated() {
        // a -> b -> a plus c -> a
        let graph = graph_of(&[("a", "b"), ("b", "a"), ("c", "a")]);
        let order = graph.sort(&names(&["c", "a", "b"]), SortDirection::ParentsFirst);

        assert_eq!(order.len(), 3);
        // whatever order the cycle settles in, c comes after a
        assert!(index_of(&order, "a") < index_of(&order, "c"));
    }

    #[test]
    fn neighbors_outside_the_input_are_ignored() {
        let graph = shop_graph();
        let order = graph.sort(&names(&["order_items", "orders"]), SortDirection::ParentsFirst);
        assert_eq!(order, names(&["orders", "order_items"]));
    }

    #[test]
    fn unknown_tables_keep_input_order() {
        let graph = shop_graph();
        let order = graph.sort(
            &names(&["zebra", "alpha", "orders", "users"]),
            SortDirection::ParentsFirst,
        );
        assert!(index_of(&order, "zebra") < index_of(&order, "alpha"));
        assert!(index_of(&order, "users") < index_of(&order, "orders"));
    }

    #[test]
    fn sort_is_deterministic() {
        let graph = shop_graph();
        let input = names(&["order_items", "reviews", "orders", "users", "products"]);
        let first = graph.sort(&input, SortDirection::ParentsFirst);
        let second = graph.sort(&input, SortDirection::ParentsFirst);
        assert_eq!(first, second);
    }
}
