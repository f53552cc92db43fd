//! `pg_dump` / `psql` invocation and backup compression

use std::path::{Path, PathBuf};
use std::process::Stdio;

use flate2::Compression;
use flate2::write::GzEncoder;
use flate2::read::GzDecoder;
use std::io::{Read, Write};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use dbsync_core::{EndpointConfig, Result, SyncError};

fn find_tool(name: &str) -> Result<PathBuf> {
    which::which(name)
        .map_err(|e| SyncError::Adapter(format!("cannot locate `{name}` in PATH: {e}")))
}

/// Base command with connection arguments and PGPASSWORD in the environment
fn tool_command(tool: &Path, cfg: &EndpointConfig) -> Command {
    let mut command = Command::new(tool);
    command
        .arg("-h")
        .arg(cfg.effective_host())
        .arg("-p")
        .arg(cfg.effective_port().to_string())
        .arg("-U")
        .arg(&cfg.username)
        .arg("-d")
        .arg(&cfg.database)
        .env("PGOPTIONS", "-c statement_timeout=0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(password) = &cfg.password {
        command.env("PGPASSWORD", password);
    }
    command
}

/// Schema-only dump of the given relations, owner and ACLs stripped.
pub(crate) async fn dump_schema_objects(
    cfg: &EndpointConfig,
    objects: &[String],
) -> Result<String> {
    if objects.is_empty() {
        return Ok(String::new());
    }

    let pg_dump = find_tool("pg_dump")?;
    let mut command = tool_command(&pg_dump, cfg);
    command
        .arg("--schema-only")
        .arg("--no-owner")
        .arg("--no-privileges")
        .arg("--schema")
        .arg("public");
    for object in objects {
        command.arg("-t").arg(format!("public.\"{object}\""));
    }

    tracing::debug!(objects = objects.len(), "running pg_dump --schema-only");
    let output = command
        .output()
        .await
        .map_err(|e| SyncError::Adapter(format!("failed to spawn pg_dump: {e}")))?;

    if !output.status.success() {
        return Err(SyncError::Adapter(format!(
            "pg_dump exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| SyncError::Adapter(format!("pg_dump produced non-UTF8 output: {e}")))
}

/// Full dump of the endpoint, gzip-compressed into
/// `dir/db_backup_<YYYY-MM-DD_HH-MM-SS>.sql.gz`.
pub(crate) async fn create_backup(cfg: &EndpointConfig, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let path = dir.join(format!("db_backup_{timestamp}.sql.gz"));

    let pg_dump = find_tool("pg_dump")?;
    let mut command = tool_command(&pg_dump, cfg);
    command.arg("--no-owner").arg("--no-privileges");

    tracing::info!(path = %path.display(), "creating backup");
    let mut child = command
        .spawn()
        .map_err(|e| SyncError::Adapter(format!("failed to spawn pg_dump: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let file = std::fs::File::create(&path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stdout
            .read(&mut buf)
            .await
            .map_err(|e| SyncError::Adapter(format!("failed to read pg_dump output: {e}")))?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| SyncError::Adapter(format!("failed to wait for pg_dump: {e}")))?;
    if !output.status.success() {
        let _ = std::fs::remove_file(&path);
        return Err(SyncError::Adapter(format!(
            "pg_dump exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(path)
}

/// Feed a gzip-compressed dump into `psql`.
///
/// The client runs with `ON_ERROR_STOP=0`; its output is scanned line by
/// line, and any `ERROR:` that is not an `already exists` notice fails the
/// restore.
pub(crate) async fn restore_backup(cfg: &EndpointConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(SyncError::Restore(format!(
            "backup file not found: {}",
            path.display()
        )));
    }

    let psql = find_tool("psql")?;
    let mut command = tool_command(&psql, cfg);
    command
        .arg("-v")
        .arg("ON_ERROR_STOP=0")
        .stdin(Stdio::piped());

    tracing::info!(path = %path.display(), "restoring backup");
    let mut child = command
        .spawn()
        .map_err(|e| SyncError::Restore(format!("failed to spawn psql: {e}")))?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let file = std::fs::File::open(path)?;
    let mut decoder = GzDecoder::new(file);

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|e| SyncError::Restore(format!("failed to decompress backup: {e}")))?;
        if n == 0 {
            break;
        }
        stdin
            .write_all(&buf[..n])
            .await
            .map_err(|e| SyncError::Restore(format!("failed to feed psql: {e}")))?;
    }
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| SyncError::Restore(format!("failed to wait for psql: {e}")))?;

    if !output.status.success() {
        return Err(SyncError::Restore(format!(
            "psql exited with {}",
            output.status
        )));
    }

    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    for line in combined.lines() {
        if let Some(error) = real_restore_error(line) {
            return Err(SyncError::Restore(error.to_string()));
        }
    }

    Ok(())
}

/// `ERROR:` lines about objects that already exist are expected when
/// restoring over a non-empty database and are not failures.
fn real_restore_error(line: &str) -> Option<&str> {
    if line.contains("ERROR:") && !line.contains("already exists") {
        Some(line.trim())
    } else {
        None
    }
}
