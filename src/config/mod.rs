//! Configuration module
//!
//! Handles loading and managing suite configuration.

pub mod env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use env::{EnvBuilder, EnvConfig, EnvGuard};

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./spec-engine.yaml",
    "./spec-engine.yml",
    "./.spec-engine.yaml",
    "./spec-engine.json",
];

/// Default grace period granted to a node after a timeout or interrupt
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 30_000;

/// Suite run configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// 1-based index of this process
    pub parallel_process: usize,

    /// Number of cooperating processes
    pub parallel_total: usize,

    /// Skip remaining specs after the first failure
    pub fail_fast: bool,

    /// Fail the suite when any spec is pending
    pub fail_on_pending: bool,

    /// Report every node as passed without running it
    pub dry_run: bool,

    /// Write a line to the writer whenever a node starts
    pub emit_spec_progress: bool,

    /// Suite-wide timeout in milliseconds
    pub timeout_ms: Option<u64>,

    /// Grace period in milliseconds
    pub grace_period_ms: u64,

    /// Emit a progress report once a node runs this long
    pub poll_progress_after_ms: Option<u64>,

    /// Re-emit progress reports at this interval after the first poll
    pub poll_progress_interval_ms: Option<u64>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            parallel_process: 1,
            parallel_total: 1,
            fail_fast: false,
            fail_on_pending: false,
            dry_run: false,
            emit_spec_progress: false,
            timeout_ms: None,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            poll_progress_after_ms: None,
            poll_progress_interval_ms: None,
        }
    }
}

impl SuiteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallel(mut self, process: usize, total: usize) -> Self {
        self.parallel_process = process;
        self.parallel_total = total;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn fail_on_pending(mut self, fail_on_pending: bool) -> Self {
        self.fail_on_pending = fail_on_pending;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn emit_spec_progress(mut self, emit: bool) -> Self {
        self.emit_spec_progress = emit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period_ms = grace_period.as_millis() as u64;
        self
    }

    pub fn with_poll_progress(mut self, after: Duration, interval: Option<Duration>) -> Self {
        self.poll_progress_after_ms = Some(after.as_millis() as u64);
        self.poll_progress_interval_ms = interval.map(|i| i.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|t| *t > 0).map(Duration::from_millis)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_progress_after(&self) -> Option<Duration> {
        self.poll_progress_after_ms
            .filter(|t| *t > 0)
            .map(Duration::from_millis)
    }

    pub fn poll_progress_interval(&self) -> Option<Duration> {
        self.poll_progress_interval_ms
            .filter(|t| *t > 0)
            .map(Duration::from_millis)
    }

    pub fn is_running_in_parallel(&self) -> bool {
        self.parallel_total > 1
    }

    pub fn is_primary_process(&self) -> bool {
        self.parallel_process == 1
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Self = if is_yaml(path.as_ref()) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = if is_yaml(path.as_ref()) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Load from the first standard location, apply environment overrides
    pub fn load_default() -> Result<Self> {
        let env = EnvConfig::load();
        let base = match env.config_file.as_ref().map(PathBuf::from).or_else(Self::find) {
            Some(path) => Self::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Self::default(),
        };
        Ok(env.apply(base))
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
