//! Taskweave Daemon
//!
//! Runs the task board auto-dispatcher and offers workflow and board
//! management subcommands against the same configuration and storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use taskweave_core::config::{self, Config};
use taskweave_daemon::board::{BoardStore, DispatcherSettings, TaskBoardDispatcher};
use taskweave_daemon::orchestration::{
    ConcurrencyLimiter, Dispatcher, ProcessExecutor, SpawnLimits, SpawnTracker,
};
use taskweave_daemon::storage::Database;

mod board_cmd;
mod workflow_cmd;

#[derive(Parser, Debug)]
#[command(name = "taskweave-daemon")]
#[command(version, about = "Taskweave daemon - task board dispatcher and workflow engine")]
struct Args {
    /// Log level filter (e.g. "info", "debug", "warn"). Defaults to the configured level.
    #[arg(long, global = true, env = "TASKWEAVE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "TASKWEAVE_LOG_JSON")]
    log_json: bool,

    /// Project directory whose `.taskweave/settings.json` overrides the global config.
    #[arg(long, global = true, env = "TASKWEAVE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long, global = true, env = "TASKWEAVE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory holding workflow definitions
    #[arg(long, global = true, env = "TASKWEAVE_WORKFLOW_DIR")]
    workflow_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the task board auto-dispatcher until Ctrl+C or SIGTERM.
    Serve {
        /// Run one scan immediately instead of waiting a full interval.
        #[arg(long)]
        scan_on_start: bool,
    },

    /// Validate, run and manage workflows.
    Workflow {
        #[command(subcommand)]
        action: workflow_cmd::WorkflowAction,
    },

    /// Create and list task board entries.
    Board {
        #[command(subcommand)]
        action: board_cmd::BoardAction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(args.project_dir.as_deref())?;
    if let Some(path) = &args.db_path {
        config.daemon.database_path = Some(path.clone());
    }
    if let Some(dir) = &args.workflow_dir {
        config.daemon.workflow_dir = Some(dir.clone());
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let log_filter = format!("taskweave_daemon={level},taskweave_core={level}");
    taskweave_core::tracing_init::init_tracing(&log_filter, args.log_json);

    match args.command {
        Command::Serve { scan_on_start } => serve(&config, scan_on_start).await,
        Command::Workflow { action } => workflow_cmd::run(action, &config).await,
        Command::Board { action } => {
            let db = open_database(&config).await?;
            board_cmd::run(action, &db).await
        }
    }
}

async fn serve(config: &Config, scan_on_start: bool) -> anyhow::Result<()> {
    if !config.board.auto_dispatch.enabled {
        anyhow::bail!("auto-dispatch is disabled in settings (board.auto_dispatch.enabled)");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_concurrent = config.daemon.max_concurrent,
        max_depth = config.spawn.max_depth,
        "Starting taskweave-daemon"
    );

    let db = open_database(config).await?;
    let store: Arc<dyn BoardStore> = Arc::new(db);
    let settings = DispatcherSettings::from_config(&config.board);
    let board = Arc::new(TaskBoardDispatcher::new(
        store,
        build_dispatcher(config),
        settings,
    ));

    if scan_on_start {
        let report = board.scan().await;
        info!(
            launched = report.launched,
            reset = report.reset,
            deferred = report.deferred,
            "Initial scan complete"
        );
    }
    board.start();

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    board.stop().await;
    info!("Daemon stopped");
    Ok(())
}

/// Wire the shared dispatch stack from config: agent CLI executor, slot
/// pools and a fresh spawn tracker.
pub(crate) fn build_dispatcher(config: &Config) -> Arc<Dispatcher> {
    let executor = ProcessExecutor::new(config.daemon.executor_bin.clone())
        .with_timeout(Duration::from_secs(config.daemon.executor_timeout_secs));
    Arc::new(Dispatcher::new(
        Arc::new(executor),
        Arc::new(ConcurrencyLimiter::from_config(&config.daemon)),
        Arc::new(SpawnTracker::new()),
        SpawnLimits::from(&config.spawn),
    ))
}

async fn open_database(config: &Config) -> anyhow::Result<Database> {
    let path = match &config.daemon.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %path.display(), "Opening database");
    Database::open(&path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))
}

/// Default database path: `<config dir>/board.db`
fn default_db_path() -> anyhow::Result<PathBuf> {
    config::database_path().ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))
}

/// Workflow directory from config, falling back to `<config dir>/workflows`.
pub(crate) fn resolve_workflow_dir(config: &Config) -> anyhow::Result<PathBuf> {
    config
        .daemon
        .workflow_dir
        .clone()
        .or_else(config::workflow_dir)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine workflow directory"))
}

/// Read a file argument as UTF-8 text.
pub(crate) fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}
