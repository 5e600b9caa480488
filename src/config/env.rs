//! Environment variable configuration
//!
//! Provides environment variable overrides for suite configuration.

use std::env;

use super::SuiteConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "SPEC_ENGINE";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Process index from SPEC_ENGINE_PARALLEL_PROCESS
    pub parallel_process: Option<usize>,
    /// Process count from SPEC_ENGINE_PARALLEL_TOTAL
    pub parallel_total: Option<usize>,
    /// Fail fast from SPEC_ENGINE_FAIL_FAST
    pub fail_fast: Option<bool>,
    /// Fail on pending from SPEC_ENGINE_FAIL_ON_PENDING
    pub fail_on_pending: Option<bool>,
    /// Dry run from SPEC_ENGINE_DRY_RUN
    pub dry_run: Option<bool>,
    /// Suite timeout from SPEC_ENGINE_TIMEOUT_MS
    pub timeout_ms: Option<u64>,
    /// Grace period from SPEC_ENGINE_GRACE_PERIOD_MS
    pub grace_period_ms: Option<u64>,
    /// Poll delay from SPEC_ENGINE_POLL_PROGRESS_AFTER_MS
    pub poll_progress_after_ms: Option<u64>,
    /// Poll interval from SPEC_ENGINE_POLL_PROGRESS_INTERVAL_MS
    pub poll_progress_interval_ms: Option<u64>,
    /// Config file from SPEC_ENGINE_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            parallel_process: get_env_parse("PARALLEL_PROCESS"),
            parallel_total: get_env_parse("PARALLEL_TOTAL"),
            fail_fast: get_env_bool("FAIL_FAST"),
            fail_on_pending: get_env_bool("FAIL_ON_PENDING"),
            dry_run: get_env_bool("DRY_RUN"),
            timeout_ms: get_env_parse("TIMEOUT_MS"),
            grace_period_ms: get_env_parse("GRACE_PERIOD_MS"),
            poll_progress_after_ms: get_env_parse("POLL_PROGRESS_AFTER_MS"),
            poll_progress_interval_ms: get_env_parse("POLL_PROGRESS_INTERVAL_MS"),
            config_file: get_env("CONFIG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.parallel_process.is_some()
            || self.parallel_total.is_some()
            || self.fail_fast.is_some()
            || self.fail_on_pending.is_some()
            || self.dry_run.is_some()
            || self.timeout_ms.is_some()
            || self.grace_period_ms.is_some()
            || self.poll_progress_after_ms.is_some()
            || self.poll_progress_interval_ms.is_some()
            || self.config_file.is_some()
    }

    /// Overlay the set variables onto `config`
    pub fn apply(&self, mut config: SuiteConfig) -> SuiteConfig {
        if let Some(process) = self.parallel_process {
            config.parallel_process = process;
        }
        if let Some(total) = self.parallel_total {
            config.parallel_total = total;
        }
        if let Some(fail_fast) = self.fail_fast {
            config.fail_fast = fail_fast;
        }
        if let Some(fail_on_pending) = self.fail_on_pending {
            config.fail_on_pending = fail_on_pending;
        }
        if let Some(dry_run) = self.dry_run {
            config.dry_run = dry_run;
        }
        if self.timeout_ms.is_some() {
            config.timeout_ms = self.timeout_ms;
        }
        if let Some(grace) = self.grace_period_ms {
            config.grace_period_ms = grace;
        }
        if self.poll_progress_after_ms.is_some() {
            config.poll_progress_after_ms = self.poll_progress_after_ms;
        }
        if self.poll_progress_interval_ms.is_some() {
            config.poll_progress_interval_ms = self.poll_progress_interval_ms;
        }
        config
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    /// Create a new environment builder
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    fn set(mut self, name: &str, value: impl ToString) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    pub fn parallel(self, process: usize, total: usize) -> Self {
        self.set("PARALLEL_PROCESS", process)
            .set("PARALLEL_TOTAL", total)
    }

    pub fn fail_fast(self, fail_fast: bool) -> Self {
        self.set("FAIL_FAST", fail_fast)
    }

    pub fn timeout_ms(self, timeout: u64) -> Self {
        self.set("TIMEOUT_MS", timeout)
    }

    pub fn grace_period_ms(self, grace: u64) -> Self {
        self.set("GRACE_PERIOD_MS", grace)
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
