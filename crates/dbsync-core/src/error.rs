//! Error types for dbsync

use thiserror::Error;

/// Core error type for dbsync operations.
///
/// Only structural failures live here. Per-row and per-statement failures
/// during a sync run are counted into the run statistics and never abort
/// the command.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Restore error: {0}")]
    Restore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for dbsync operations
pub type Result<T> = std::result::Result<T, SyncError>;
