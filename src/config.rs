//! TOML configuration for jobwarden.
//!
//! The configuration file is loaded once at startup. When it does not exist a
//! file with compiled-in defaults (including the default task set) is written
//! in its place so operators have something to edit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::scheduler::profiles;
use crate::scheduler::task::TaskDefinition;

/// Environment variable overriding the configuration file path.
pub const CONFIG_ENV: &str = "JOBWARDEN_CONFIG";

/// Path used when neither `--config` nor `JOBWARDEN_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "jobwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobwardenConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl Default for JobwardenConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            runner: RunnerConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
            tasks: profiles::defaults(),
        }
    }
}

impl JobwardenConfig {
    /// Resolve the config path: explicit flag, then `JOBWARDEN_CONFIG`, then
    /// `jobwarden.toml` in the working directory.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(CONFIG_ENV) {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        debug!(path = %path.display(), tasks = config.tasks.len(), "loaded configuration");
        Ok(config)
    }

    /// Load `path`, or write the defaults there and return them.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        config.save(path)?;
        info!(path = %path.display(), "wrote default configuration");
        Ok(config)
    }

    /// Serialize to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create config directory: {}", parent.display())
                })?;
            }
        }
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Reject configurations the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_dispatches == 0 {
            anyhow::bail!("scheduler.max_concurrent_dispatches must be at least 1");
        }
        if self.scheduler.tick_interval_secs == 0 {
            anyhow::bail!("scheduler.tick_interval_secs must be at least 1");
        }
        if self.monitor.check_interval_secs == 0 {
            anyhow::bail!("monitor.check_interval_secs must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if task.subjects.is_empty() {
                anyhow::bail!("task '{}' has no subjects", task.task_id);
            }
            if !seen.insert(task.task_id.as_str()) {
                anyhow::bail!("duplicate task id '{}'", task.task_id);
            }
        }
        for pattern in &self.monitor.subject_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("invalid monitor.subject_patterns entry: {}", pattern))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Ledger database location and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file shared by every process.
    pub db_path: PathBuf,
    /// Records older than this many days are pruned daily by `serve`.
    /// Zero disables automatic pruning.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/jobwarden.db"),
            retention_days: 90,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Polling granularity of the tick loop.
    pub tick_interval_secs: u64,
    /// Global cap on simultaneous in-flight job runner calls.
    pub max_concurrent_dispatches: usize,
    /// `max_failures` for tasks that do not set their own.
    pub default_max_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 60,
            max_concurrent_dispatches: 2,
            default_max_failures: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// External worker program launched for each dispatch.
///
/// `args` may contain `{execution_id}`, `{task_id}`, `{subject}` (first
/// subject), `{subjects}`, `{strategies}` and `{timeframes}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec![
                "-m".to_string(),
                "backtest_worker".to_string(),
                "--execution-id".to_string(),
                "{execution_id}".to_string(),
                "--symbols".to_string(),
                "{subjects}".to_string(),
                "--strategies".to_string(),
                "{strategies}".to_string(),
                "--timeframes".to_string(),
                "{timeframes}".to_string(),
            ],
            working_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Process health monitor thresholds and classifier rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
    /// Workers older than this are terminated regardless of parentage.
    pub max_execution_hours: u64,
    /// Orphans younger than this are left alone.
    pub orphan_grace_minutes: u64,
    /// Wait between SIGTERM and SIGKILL.
    pub termination_grace_secs: u64,
    /// Running records younger than this are never reconciled away.
    pub reconcile_confirmation_minutes: u64,
    /// Process image names identifying the worker runtime (prefix match).
    pub runtime_names: Vec<String>,
    /// Command-line substrings identifying the analysis/training worker pool.
    pub keywords: Vec<String>,
    /// Regexes whose first capture group is the job subject.
    pub subject_patterns: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 300,
            max_execution_hours: 6,
            orphan_grace_minutes: 5,
            termination_grace_secs: 3,
            reconcile_confirmation_minutes: 60,
            runtime_names: vec!["python".to_string()],
            keywords: vec![
                "backtest".to_string(),
                "training".to_string(),
                "optimization".to_string(),
                "symbol_addition".to_string(),
                "retrain".to_string(),
            ],
            subject_patterns: vec![
                r"--symbols?[= ]([A-Za-z0-9_./-]+)".to_string(),
                r"--subject[= ]([A-Za-z0-9_./-]+)".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Tracing subscriber settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
