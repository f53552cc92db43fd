//! Subcommand implementations

use std::future::Future;
use std::io::IsTerminal;

use anyhow::{Context, Result};
use tracing::info;

use dbsync_core::{Connection, ConnectionProfile, EndpointConfig, SyncConfig, SyncError};
use dbsync_driver_postgres::{PostgresAdapter, PostgresConnection, SshTunnel};
use dbsync_engine::{
    BackupManager, CloneOutcome, Orchestrator, PullOutcome, SyncOptions, SyncPlan,
};

use crate::cli::{CloneArgs, CommonArgs, PullArgs, RestoreArgs};
use crate::output;
use crate::progress::ConsoleProgress;

/// Everything a sync command needs: both connections, the (optional) tunnel
/// keeping the source reachable, and the endpoint configs the shell tools
/// dial.
struct Session {
    profile: ConnectionProfile,
    // dropping it tears the port forward down
    tunnel: Option<SshTunnel>,
    source_cfg: EndpointConfig,
    source: PostgresConnection,
    target: PostgresConnection,
}

impl Session {
    async fn open(config: &SyncConfig, name: Option<&str>) -> Result<Self> {
        let (name, profile) = config.resolve_connection(name)?;
        info!(connection = name, "using connection");

        let (tunnel, source_cfg) = match &profile.tunnel {
            Some(tunnel_cfg) => {
                let tunnel_cfg = tunnel_cfg.clone();
                let remote_host = profile.source.effective_host().to_string();
                let remote_port = profile.source.effective_port();
                let tunnel = tokio::task::spawn_blocking(move || {
                    SshTunnel::connect(&tunnel_cfg, &remote_host, remote_port)
                })
                .await
                .context("tunnel task panicked")?
                .map_err(|e| SyncError::Tunnel(e.to_string()))?;
                let local = profile
                    .source
                    .with_address(tunnel.local_host(), tunnel.local_port());
                (Some(tunnel), local)
            }
            None => (None, profile.source.clone()),
        };

        let source = PostgresConnection::connect(&source_cfg).await?;
        // verify the source end-to-end before any analysis work
        source
            .query("SELECT 1", &[])
            .await
            .map_err(|e| SyncError::Tunnel(format!("source connection check failed: {e}")))?;
        let target = PostgresConnection::connect(&profile.target).await?;

        Ok(Self {
            profile: profile.clone(),
            tunnel,
            source_cfg,
            source,
            target,
        })
    }

    fn log_tunnel_traffic(&self) {
        if let Some(tunnel) = &self.tunnel {
            let stats = tunnel.stats();
            tracing::debug!(
                connections = stats.connections,
                forward_failures = stats.forward_failures,
                bytes_up = stats.bytes_up,
                bytes_down = stats.bytes_down,
                "tunnel traffic"
            );
        }
    }
}

/// Run the command future, but bail out cleanly on SIGINT/SIGTERM.
///
/// Returns `None` when interrupted; dropping the session afterwards closes
/// the tunnel, and the process exits 0.
async fn cancellable<T>(work: impl Future<Output = dbsync_core::Result<T>>) -> Result<Option<T>> {
    tokio::select! {
        result = work => Ok(Some(result?)),
        _ = shutdown_signal() => {
            info!("interrupted; shutting down");
            Ok(None)
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn confirm(prompt: &str) -> bool {
    if !std::io::stdin().is_terminal() {
        return true;
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

fn sync_options(common: &CommonArgs, config: &SyncConfig) -> SyncOptions {
    SyncOptions {
        force: common.force,
        tables: common.tables.clone(),
        views: common.views.clone(),
        include_excluded: common.include_excluded,
        dry_run: common.dry_run,
        skip_backup: common.skip_backup,
        batch_size: common.batch_size.unwrap_or(config.batch_size),
        memory_limit_mb: common.memory_limit,
        ..Default::default()
    }
}

pub async fn pull(config: SyncConfig, args: PullArgs) -> Result<()> {
    let session = Session::open(&config, args.common.sync_connection.as_deref()).await?;

    let mut options = sync_options(&args.common, &config);
    options.analyze_only = args.analyze_only;
    options.skip_sequences = args.skip_sequences;

    let adapter = PostgresAdapter::new();
    let progress = ConsoleProgress::new();
    let orchestrator = Orchestrator::new(
        &adapter,
        &session.source,
        &session.target,
        &session.source_cfg,
        &session.profile.target,
        &config.backup,
        session.profile.excluded_tables.clone(),
        options,
    )
    .with_progress(&progress);

    let gate = |plan: &SyncPlan| {
        let actionable = plan.actionable();
        confirm(&format!(
            "Sync {} tables into '{}'?",
            actionable.len(),
            session.profile.target.database
        ))
    };

    let Some(outcome) = cancellable(orchestrator.pull(&gate)).await? else {
        return Ok(());
    };

    match outcome {
        PullOutcome::Analyzed { diffs, plan } => output::print_analysis(&diffs, &plan),
        PullOutcome::UpToDate { .. } => println!("already in sync; nothing to do"),
        PullOutcome::DryRun {
            plan, actionable, ..
        } => output::print_dry_run(&plan, &actionable),
        PullOutcome::Aborted => println!("aborted"),
        PullOutcome::Completed {
            report,
            refresh,
            backup_path,
            sequences_reset,
        } => {
            if let Some(path) = backup_path {
                println!("backup: {}", path.display());
            }
            output::print_report(&report, &refresh, sequences_reset);
        }
    }
    session.log_tunnel_traffic();
    Ok(())
}

pub async fn clone_database(config: SyncConfig, args: CloneArgs) -> Result<()> {
    let session = Session::open(&config, args.common.sync_connection.as_deref()).await?;

    let mut options = sync_options(&args.common, &config);
    options.skip_views = args.skip_views;
    options.skip_sync_data = args.skip_sync_data;

    let adapter = PostgresAdapter::new();
    let progress = ConsoleProgress::new();
    let orchestrator = Orchestrator::new(
        &adapter,
        &session.source,
        &session.target,
        &session.source_cfg,
        &session.profile.target,
        &config.backup,
        session.profile.excluded_tables.clone(),
        options,
    )
    .with_progress(&progress);

    let gate = |tables: &[String]| {
        confirm(&format!(
            "DROP and recreate {} tables in '{}'?",
            tables.len(),
            session.profile.target.database
        ))
    };

    let Some(outcome) = cancellable(orchestrator.clone_database(&gate)).await? else {
        return Ok(());
    };

    match outcome {
        CloneOutcome::DryRun { tables, views } => {
            println!("dry run; would drop and recreate:");
            for table in &tables {
                println!("  {table}");
            }
            if !views.is_empty() {
                println!("views: {}", views.join(", "));
            }
        }
        CloneOutcome::Aborted => println!("aborted"),
        CloneOutcome::Completed {
            report,
            refresh,
            backup_path,
            sequences_reset,
        } => {
            if let Some(path) = backup_path {
                println!("backup: {}", path.display());
            }
            output::print_report(&report, &refresh, sequences_reset);
        }
    }
    session.log_tunnel_traffic();
    Ok(())
}

pub async fn restore(config: SyncConfig, args: RestoreArgs) -> Result<()> {
    let (_, profile) = config.resolve_connection(args.sync_connection.as_deref())?;
    let adapter = PostgresAdapter::new();
    let backups = BackupManager::new(&adapter, &config.backup);

    if args.list {
        output::print_backup_list(&backups.list()?);
        return Ok(());
    }

    let path = match &args.file {
        Some(file) => backups
            .find(file)?
            .with_context(|| format!("no backup matches '{file}'"))?,
        None => backups
            .list()?
            .first()
            .map(|backup| backup.path.clone())
            .context("no backups found")?,
    };

    if !confirm(&format!(
        "Restore {} into '{}'?",
        path.display(),
        profile.target.database
    )) {
        println!("aborted");
        return Ok(());
    }

    let target = profile.target.clone();
    let Some(()) = cancellable(backups.restore(&target, &path)).await? else {
        return Ok(());
    };
    println!("restored {}", path.display());
    Ok(())
}
