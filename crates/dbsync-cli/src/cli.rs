//! Command-line surface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "dbsync",
    about = "One-way PostgreSQL synchronization from a remote source over SSH",
    version
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "dbsync.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Incrementally sync the target database from the source
    Pull(PullArgs),
    /// Drop and recreate everything on the target from the source
    Clone(CloneArgs),
    /// Restore the target database from a backup
    Restore(RestoreArgs),
}

#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    /// Connection name from the configuration file
    #[arg(long = "sync-connection")]
    pub sync_connection: Option<String>,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub force: bool,

    /// Only sync these tables (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub tables: Option<Vec<String>>,

    /// Only refresh these views (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub views: Option<Vec<String>>,

    /// Also sync tables excluded by the connection profile
    #[arg(long)]
    pub include_excluded: bool,

    /// Show what would be done without touching the target
    #[arg(long)]
    pub dry_run: bool,

    /// Do not create a backup before syncing
    #[arg(long)]
    pub skip_backup: bool,

    /// Rows per batch for paging and chunked deletes
    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Advisory memory budget in MB (-1 = unrestricted)
    #[arg(long, default_value_t = -1)]
    pub memory_limit: i64,
}

#[derive(Debug, Args)]
pub struct PullArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Print the per-table analysis and exit
    #[arg(long)]
    pub analyze_only: bool,

    /// Do not reset sequences after syncing
    #[arg(long)]
    pub skip_sequences: bool,
}

#[derive(Debug, Args)]
pub struct CloneArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Do not recreate views
    #[arg(long)]
    pub skip_views: bool,

    /// Recreate structure only, without copying data
    #[arg(long)]
    pub skip_sync_data: bool,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Connection name from the configuration file
    #[arg(long = "sync-connection")]
    pub sync_connection: Option<String>,

    /// List available backups and exit
    #[arg(long)]
    pub list: bool,

    /// Backup to restore: exact filename, path, or substring of a filename.
    /// Defaults to the most recent backup.
    pub file: Option<String>,
}
