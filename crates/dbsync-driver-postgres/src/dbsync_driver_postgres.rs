//! PostgreSQL driver implementation for dbsync

mod adapter;
mod connection;
mod dump;
mod sql;
mod ssh;
mod statements;

pub use adapter::PostgresAdapter;
pub use connection::PostgresConnection;
pub use ssh::{SshTunnel, SshTunnelError, TunnelStats};
