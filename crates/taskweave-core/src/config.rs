//! Configuration resolution for Taskweave.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/taskweave/settings.json)
//! 3. Project config (.taskweave/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Taskweave configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub spawn: SpawnConfig,
    #[serde(default)]
    pub board: BoardConfig,
}

/// Daemon-wide settings: slot pools, storage locations, the agent executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Capacity of the global slot pool.
    pub max_concurrent: usize,
    /// Child slot pool capacity is `max_concurrent * child_pool_multiplier`.
    pub child_pool_multiplier: usize,
    pub database_path: Option<PathBuf>,
    pub workflow_dir: Option<PathBuf>,
    pub log_level: String,
    /// Agent CLI invoked by the process executor.
    pub executor_bin: PathBuf,
    /// Per-invocation deadline enforced by the process executor.
    pub executor_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            child_pool_multiplier: 2,
            database_path: None,
            workflow_dir: None,
            log_level: "info".to_string(),
            executor_bin: PathBuf::from("claude"),
            executor_timeout_secs: 600,
        }
    }
}

impl DaemonConfig {
    /// Size of the child slot pool derived from the global pool.
    pub const fn child_pool_size(&self) -> usize {
        let multiplier = if self.child_pool_multiplier == 0 {
            2
        } else {
            self.child_pool_multiplier
        };
        self.max_concurrent.saturating_mul(multiplier)
    }
}

/// Nesting and fan-out limits for agent-initiated sub-tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    pub max_depth: u32,
    /// Values <= 0 fall back to the default of 5.
    pub max_children_per_task: i64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children_per_task: 5,
        }
    }
}

impl SpawnConfig {
    pub fn effective_max_children(&self) -> usize {
        usize::try_from(self.max_children_per_task)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(5)
    }
}

/// Task board settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Failed tasks are re-queued until they have been retried this often.
    pub max_retries: u32,
    pub auto_dispatch: AutoDispatchConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            auto_dispatch: AutoDispatchConfig::default(),
        }
    }
}

/// Polling dispatcher settings. Durations are Go-style strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDispatchConfig {
    pub enabled: bool,
    pub interval: String,
    pub stuck_threshold: String,
    /// Launch cap per scan; 0 means unlimited.
    pub max_concurrent_tasks: usize,
    pub default_model: Option<String>,
    /// Upper bound on a task's budget in USD; 0 disables the clamp.
    pub max_budget: f64,
}

impl Default for AutoDispatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "5m".to_string(),
            stuck_threshold: "2h".to_string(),
            max_concurrent_tasks: 0,
            default_model: None,
            max_budget: 0.0,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".taskweave").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Taskweave's directory under the platform config root.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".taskweave"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/taskweave"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("taskweave"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("settings.json"))
}

/// Default location of the board database.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("board.db"))
}

/// Default directory holding workflow documents.
pub fn workflow_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("workflows"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Parse a settings document. Missing sections and fields take their defaults.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(serde_json::from_str(content)?)
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.daemon.database_path.is_some() {
        base.daemon.database_path = overlay.daemon.database_path;
    }
    if overlay.daemon.workflow_dir.is_some() {
        base.daemon.workflow_dir = overlay.daemon.workflow_dir;
    }
    base.daemon.max_concurrent = overlay.daemon.max_concurrent;
    base.daemon.child_pool_multiplier = overlay.daemon.child_pool_multiplier;
    base.daemon.log_level = overlay.daemon.log_level;
    base.daemon.executor_bin = overlay.daemon.executor_bin;
    base.daemon.executor_timeout_secs = overlay.daemon.executor_timeout_secs;

    base.spawn = overlay.spawn;

    let default_model = overlay
        .board
        .auto_dispatch
        .default_model
        .clone()
        .or_else(|| base.board.auto_dispatch.default_model.take());
    base.board = overlay.board;
    base.board.auto_dispatch.default_model = default_model;
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("TASKWEAVE_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
        config.daemon.max_concurrent = n;
    }
    if let Some(n) = lookup("TASKWEAVE_MAX_DEPTH").and_then(|v| v.parse().ok()) {
        config.spawn.max_depth = n;
    }
    if let Some(n) = lookup("TASKWEAVE_MAX_CHILDREN").and_then(|v| v.parse().ok()) {
        config.spawn.max_children_per_task = n;
    }
    if let Some(val) = lookup("TASKWEAVE_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = lookup("TASKWEAVE_DEFAULT_MODEL") {
        config.board.auto_dispatch.default_model = Some(val);
    }
    if let Some(val) = lookup("TASKWEAVE_DISPATCH_INTERVAL") {
        config.board.auto_dispatch.interval = val;
    }
    if let Some(n) = lookup("TASKWEAVE_MAX_CONCURRENT_TASKS").and_then(|v| v.parse().ok()) {
        config.board.auto_dispatch.max_concurrent_tasks = n;
    }
}
