//! Configuration file model
//!
//! dbsync reads a single TOML file describing named connections, each with a
//! source endpoint (reached through an optional SSH tunnel), a target
//! endpoint, and a set of excluded tables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Result, SyncError};

fn default_batch_size() -> u32 {
    10_000
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("backups")
}

fn default_keep_last() -> usize {
    5
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_timeout_seconds() -> u32 {
    30
}

fn default_keepalive_seconds() -> u32 {
    30
}

/// Root of the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Connection used when the CLI names none
    #[serde(default)]
    pub default: Option<String>,
    /// Default batch size; the CLI flag overrides it
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionProfile>,
}

/// Backup directory and retention settings
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_path")]
    pub path: PathBuf,
    /// How many backups `cleanup` keeps
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            path: default_backup_path(),
            keep_last: default_keep_last(),
        }
    }
}

/// One named source/target pair
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionProfile {
    /// SSH tunnel to reach the source; omit for a directly reachable source
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
    pub source: EndpointConfig,
    pub target: EndpointConfig,
    /// Tables never synced unless `--include-excluded` is passed
    #[serde(default)]
    pub excluded_tables: Vec<String>,
}

/// A PostgreSQL endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub driver: String,
    /// Hostname as seen from the connecting side (through the tunnel for the
    /// source); defaults to localhost
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

impl EndpointConfig {
    pub fn effective_host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(5432)
    }

    /// Endpoint with host/port replaced, used to point at a tunnel's local
    /// listener
    pub fn with_address(&self, host: &str, port: u16) -> EndpointConfig {
        EndpointConfig {
            host: Some(host.to_string()),
            port: Some(port),
            ..self.clone()
        }
    }
}

/// SSH tunnel settings for reaching the source database
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Authenticate through a running SSH agent
    #[serde(default)]
    pub use_agent: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u32,
}

/// How the tunnel authenticates, derived from the profile fields
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

impl TunnelConfig {
    /// Resolve the authentication method. Precedence: explicit agent, then
    /// private key, then password.
    pub fn auth(&self) -> Result<SshAuth> {
        if self.use_agent {
            return Ok(SshAuth::Agent);
        }
        if let Some(path) = &self.private_key {
            return Ok(SshAuth::PrivateKey {
                path: path.clone(),
                passphrase: self.passphrase.clone(),
            });
        }
        if let Some(password) = &self.password {
            return Ok(SshAuth::Password(password.clone()));
        }
        Err(SyncError::Config(format!(
            "tunnel '{}' has no authentication method (password, private_key or use_agent)",
            self.host
        )))
    }
}

impl SyncConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: SyncConfig = toml::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, profile) in &self.connections {
            for (side, endpoint) in [("source", &profile.source), ("target", &profile.target)] {
                match endpoint.driver.as_str() {
                    "postgres" | "postgresql" => {}
                    other => {
                        return Err(SyncError::Config(format!(
                            "connection '{name}' {side}: unknown driver '{other}'"
                        )));
                    }
                }
            }
            if let Some(tunnel) = &profile.tunnel {
                tunnel.auth()?;
            }
        }
        if let Some(default) = &self.default {
            if !self.connections.contains_key(default) {
                return Err(SyncError::Config(format!(
                    "default connection '{default}' is not defined"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a connection by CLI name, falling back to the configured
    /// default
    pub fn resolve_connection<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> Result<(&'a str, &'a ConnectionProfile)> {
        let name = name
            .or(self.default.as_deref())
            .ok_or_else(|| {
                SyncError::Config("no connection named and no default configured".to_string())
            })?;
        let profile = self.connections.get(name).ok_or_else(|| {
            SyncError::Config(format!("connection '{name}' is not defined"))
        })?;
        Ok((name, profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        default = "staging"
        batch_size = 500

        [backup]
        path = "var/backups"
        keep_last = 3

        [connections.staging]
        excluded_tables = ["migrations", "audit_log"]

        [connections.staging.tunnel]
        host = "bastion.example.com"
        username = "deploy"
        password = "hunter2"

        [connections.staging.source]
        driver = "postgres"
        database = "app"
        username = "app"
        password = "secret"

        [connections.staging.target]
        driver = "postgres"
        host = "127.0.0.1"
        port = 5433
        database = "app_local"
        username = "postgres"
    "#;

    #[test]
    fn parses_full_profile() {
        let config: SyncConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.batch_size, 500);
        assert_eq!(config.backup.keep_last, 3);

        let (name, profile) = config.resolve_connection(None).unwrap();
        assert_eq!(name, "staging");
        assert_eq!(profile.excluded_tables, vec!["migrations", "audit_log"]);
        assert_eq!(profile.source.effective_host(), "localhost");
        assert_eq!(profile.source.effective_port(), 5432);
        assert_eq!(profile.target.effective_port(), 5433);

        let tunnel = profile.tunnel.as_ref().unwrap();
        assert_eq!(tunnel.port, 22);
        assert!(matches!(tunnel.auth().unwrap(), SshAuth::Password(_)));
    }

    #[test]
    fn rejects_unknown_driver() {
        let raw = SAMPLE.replace("driver = \"postgres\"", "driver = \"oracle\"");
        let config: SyncConfig = toml::from_str(&raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(err.to_string().contains("unknown driver"));
    }

    #[test]
    fn rejects_missing_default() {
        let raw = SAMPLE.replace("default = \"staging\"", "default = \"production\"");
        let config: SyncConfig = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn tunnel_without_auth_is_rejected() {
        let raw = SAMPLE.replace("password = \"hunter2\"", "");
        let config: SyncConfig = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn named_connection_overrides_default() {
        let config: SyncConfig = toml::from_str(SAMPLE).unwrap();
        assert!(config.resolve_connection(Some("missing")).is_err());
        let (name, _) = config.resolve_connection(Some("staging")).unwrap();
        assert_eq!(name, "staging");
    }

    #[test]
    fn with_address_repoints_endpoint() {
        let config: SyncConfig = toml::from_str(SAMPLE).unwrap();
        let (_, profile) = config.resolve_connection(None).unwrap();
        let local = profile.source.with_address("127.0.0.1", 15432);
        assert_eq!(local.effective_host(), "127.0.0.1");
        assert_eq!(local.effective_port(), 15432);
        assert_eq!(local.database, "app");
    }
}
