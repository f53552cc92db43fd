//! indicatif-backed progress rendering

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

use dbsync_engine::SyncProgress;

/// One bar at a time: the engine syncs tables strictly sequentially.
pub struct ConsoleProgress {
    current: Mutex<Option<ProgressBar>>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    fn bar_for(&self, table: &str, total_rows: Option<u64>) -> ProgressBar {
        match total_rows {
            Some(total) if total > 0 => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{prefix:.bold} [{bar:30}] {pos}/{len} rows ({per_sec})",
                    )
                    .expect("static template")
                    .progress_chars("=> "),
                );
                bar.set_prefix(table.to_string());
                bar
            }
            _ => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template("{prefix:.bold} {spinner} {pos} rows")
                        .expect("static template"),
                );
                bar.set_prefix(table.to_string());
                bar
            }
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProgress for ConsoleProgress {
    fn table_started(&self, table: &str, total_rows: Option<u64>) {
        let bar = self.bar_for(table, total_rows);
        if let Some(previous) = self.current.lock().unwrap().replace(bar) {
            previous.finish_and_clear();
        }
    }

    fn rows_written(&self, _table: &str, rows: u64) {
        if let Some(bar) = self.current.lock().unwrap().as_ref() {
            bar.inc(rows);
        }
    }

    fn table_finished(&self, _table: &str) {
        if let Some(bar) = self.current.lock().unwrap().take() {
            bar.finish_and_clear();
        }
    }
}
