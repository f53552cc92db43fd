//! Backup lifecycle: create, list, find, prune, restore

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};

use dbsync_core::{BackupConfig, DatabaseAdapter, EndpointConfig, Result};

/// One backup file on disk
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub modified: DateTime<Local>,
}

impl BackupInfo {
    /// Size rendered for humans (B/KB/MB/GB)
    pub fn human_size(&self) -> String {
        const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
        let mut size = self.size_bytes as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{} {}", self.size_bytes, UNITS[unit])
        } else {
            format!("{:.1} {}", size, UNITS[unit])
        }
    }
}

/// Manages the backup directory configured under `[backup]`
pub struct BackupManager<'a> {
    adapter: &'a dyn DatabaseAdapter,
    config: &'a BackupConfig,
}

impl<'a> BackupManager<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter, config: &'a BackupConfig) -> Self {
        Self { adapter, config }
    }

    pub fn directory(&self) -> &Path {
        &self.config.path
    }

    /// Compressed full dump of `endpoint` into the backup directory
    pub async fn create(&self, endpoint: &EndpointConfig) -> Result<PathBuf> {
        self.adapter.create_backup(endpoint, &self.config.path).await
    }

    /// All `*.sql.gz` files, newest first by modification time
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        let entries = match std::fs::read_dir(&self.config.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.ends_with(".sql.gz") {
                continue;
            }
            let metadata = entry.metadata()?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            backups.push(BackupInfo {
                path,
                filename,
                size_bytes: metadata.len(),
                modified: modified.into(),
            });
        }

        backups.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(backups)
    }

    /// Resolve `name` to a backup file: exact filename in the backup
    /// directory, then exact path, then the first listed backup whose
    /// filename contains `name`.
    pub fn find(&self, name: &str) -> Result<Option<PathBuf>> {
        let candidate = self.config.path.join(name);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        let as_path = PathBuf::from(name);
        if as_path.is_file() {
            return Ok(Some(as_path));
        }
        Ok(self
            .list()?
            .into_iter()
            .find(|backup| backup.filename.contains(name))
            .map(|backup| backup.path))
    }

    /// Delete all but the most recent `keep_last` backups; returns how many
    /// were removed.
    pub fn cleanup(&self) -> Result<usize> {
        let backups = self.list()?;
        let mut removed = 0;
        for backup in backups.iter().skip(self.config.keep_last) {
            match std::fs::remove_file(&backup.path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %backup.path.display(), error = %e, "could not prune backup")
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, keep_last = self.config.keep_last, "pruned old backups");
        }
        Ok(removed)
    }

    /// Feed a backup back into `endpoint`
    pub async fn restore(&self, endpoint: &EndpointConfig, path: &Path) -> Result<()> {
        self.adapter.restore_backup(endpoint, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeAdapter;
    use std::time::Duration;

    fn write_backup(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"dump").unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
        path
    }

    fn manager_for<'a>(config: &'a BackupConfig, adapter: &'a FakeAdapter) -> BackupManager<'a> {
        BackupManager::new(adapter, config)
    }

    #[test]
    fn list_is_newest_first_and_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        write_backup(dir.path(), "db_backup_2026-01-01_00-00-00.sql.gz", 300);
        write_backup(dir.path(), "db_backup_2026-02-01_00-00-00.sql.gz", 100);
        write_backup(dir.path(), "db_backup_2026-03-01_00-00-00.sql.gz", 200);
        std::fs::write(dir.path().join("notes.txt"), b"not a backup").unwrap();

        let config = BackupConfig {
            path: dir.path().to_path_buf(),
            keep_last: 5,
        };
        let adapter = FakeAdapter::new();
        let backups = manager_for(&config, &adapter).list().unwrap();

        let names: Vec<&str> = backups.iter().map(|b| b.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "db_backup_2026-02-01_00-00-00.sql.gz",
                "db_backup_2026-03-01_00-00-00.sql.gz",
                "db_backup_2026-01-01_00-00-00.sql.gz",
            ]
        );
    }

    #[test]
    fn list_of_missing_directory_is_empty() {
        let config = BackupConfig {
            path: PathBuf::from("/nonexistent/dbsync-backups"),
            keep_last: 5,
        };
        let adapter = FakeAdapter::new();
        assert!(manager_for(&config, &adapter).list().unwrap().is_empty());
    }

    #[test]
    fn find_prefers_exact_then_substring() {
        let dir = tempfile::tempdir().unwrap();
        let exact = write_backup(dir.path(), "db_backup_2026-01-15_10-00-00.sql.gz", 100);
        write_backup(dir.path(), "db_backup_2026-01-20_10-00-00.sql.gz", 50);

        let config = BackupConfig {
            path: dir.path().to_path_buf(),
            keep_last: 5,
        };
        let adapter = FakeAdapter::new();
        let manager = manager_for(&config, &adapter);

        assert_eq!(
            manager
                .find("db_backup_2026-01-15_10-00-00.sql.gz")
                .unwrap(),
            Some(exact.clone())
        );
        assert_eq!(
            manager.find(exact.to_str().unwrap()).unwrap(),
            Some(exact.clone())
        );
        // substring match resolves through the newest-first listing
        let by_substring = manager.find("2026-01-15").unwrap();
        assert_eq!(by_substring, Some(exact));
        assert_eq!(manager.find("2030").unwrap(), None);
    }

    #[test]
    fn cleanup_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        write_backup(dir.path(), "db_backup_a.sql.gz", 400);
        write_backup(dir.path(), "db_backup_b.sql.gz", 300);
        let keep_new = write_backup(dir.path(), "db_backup_c.sql.gz", 200);
        let keep_newest = write_backup(dir.path(), "db_backup_d.sql.gz", 100);

        let config = BackupConfig {
            path: dir.path().to_path_buf(),
            keep_last: 2,
        };
        let adapter = FakeAdapter::new();
        let manager = manager_for(&config, &adapter);

        assert_eq!(manager.cleanup().unwrap(), 2);
        let remaining: Vec<PathBuf> =
            manager.list().unwrap().into_iter().map(|b| b.path).collect();
        assert_eq!(remaining, vec![keep_newest, keep_new]);
    }

    #[test]
    fn human_size_scales_units() {
        let info = BackupInfo {
            path: PathBuf::new(),
            filename: String::new(),
            size_bytes: 512,
            modified: Local::now(),
        };
        assert_eq!(info.human_size(), "512 B");
        let info = BackupInfo {
            size_bytes: 5 * 1024 * 1024,
            ..info
        };
        assert_eq!(info.human_size(), "5.0 MB");
    }
}
