//! Plain-text rendering of analysis results, plans, and run reports

use dbsync_engine::{BackupInfo, RefreshOutcome, SyncPlan, SyncReport, TableDiff};

pub fn print_analysis(diffs: &[TableDiff], plan: &SyncPlan) {
    println!(
        "{:<32} {:>10} {:>10} {:>9}  FLAGS",
        "TABLE", "LOCAL", "REMOTE", "DELETES"
    );
    for diff in diffs {
        if !diff.needs_sync {
            continue;
        }
        println!(
            "{:<32} {:>10} {:>10} {:>9}  {}",
            diff.table,
            diff.local_count,
            diff.remote_count,
            diff.ids_to_delete.len(),
            diff_flags(diff),
        );
    }
    if diffs.iter().all(|diff| !diff.needs_sync) {
        println!("(no differences)");
    }

    if !plan.missing_tables.is_empty() {
        println!("missing tables: {}", plan.missing_tables.join(", "));
    }
    if !plan.changed_tables.is_empty() {
        println!("changed tables: {}", plan.changed_tables.join(", "));
    }
    if !plan.missing_views.is_empty() {
        println!("missing views: {}", plan.missing_views.join(", "));
    }
    if !plan.changed_views.is_empty() {
        println!("changed views: {}", plan.changed_views.join(", "));
    }
}

fn diff_flags(diff: &TableDiff) -> String {
    let mut flags = Vec::new();
    if diff.refreshed {
        flags.push("refresh");
    }
    if diff.has_updates {
        flags.push("updates");
    }
    if diff.metadata_error {
        flags.push("metadata-error");
    }
    if diff.is_parent {
        flags.push("parent");
    }
    flags.join(",")
}

pub fn print_dry_run(plan: &SyncPlan, actionable: &[TableDiff]) {
    println!("dry run; nothing was changed\n");
    for diff in actionable {
        let mut actions = Vec::new();
        if diff.refreshed {
            actions.push("rebuild structure + full reload".to_string());
        } else {
            if !diff.ids_to_delete.is_empty() {
                actions.push(format!("delete {} rows", diff.ids_to_delete.len()));
            }
            actions.push("upsert from source".to_string());
        }
        println!("  {:<32} {}", diff.table, actions.join(", "));
    }
    if !plan.views_to_refresh.is_empty() {
        println!("  views to refresh: {}", plan.views_to_refresh.join(", "));
    }
}

pub fn print_report(report: &SyncReport, refresh: &RefreshOutcome, sequences_reset: usize) {
    println!(
        "\n{:<32} {:>9} {:>9} {:>9} {:>7}",
        "TABLE", "INSERTED", "UPDATED", "DELETED", "ERRORS"
    );
    for (table, stats) in report.tables() {
        println!(
            "{:<32} {:>9} {:>9} {:>9} {:>7}",
            table, stats.inserted, stats.updated, stats.deleted, stats.errors
        );
    }
    let totals = report.totals();
    println!(
        "{:<32} {:>9} {:>9} {:>9} {:>7}",
        "TOTAL", totals.inserted, totals.updated, totals.deleted, totals.errors
    );

    if refresh.created_tables + refresh.created_sequences + refresh.created_constraints > 0 {
        println!(
            "structure: {} tables, {} sequences, {} constraints created",
            refresh.created_tables, refresh.created_sequences, refresh.created_constraints
        );
    }
    if refresh.skipped_fk > 0 {
        println!(
            "skipped {} foreign keys referencing tables outside the sync scope",
            refresh.skipped_fk
        );
    }
    for error in &refresh.errors {
        println!("schema error: {error}");
    }
    if sequences_reset > 0 {
        println!("reset {sequences_reset} sequences");
    }
}

pub fn print_backup_list(backups: &[BackupInfo]) {
    if backups.is_empty() {
        println!("no backups found");
        return;
    }
    println!("{:<44} {:>10}  DATE", "FILE", "SIZE");
    for backup in backups {
        println!(
            "{:<44} {:>10}  {}",
            backup.filename,
            backup.human_size(),
            backup.modified.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}
