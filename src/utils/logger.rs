//! Logging utilities
//!
//! Installs the `tracing` subscriber for suite lifecycle logs. A directive in
//! `SPEC_ENGINE_LOG` takes precedence over the level passed in code.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive
pub const LOG_ENV_VAR: &str = "SPEC_ENGINE_LOG";

const TARGET: &str = "spec_engine";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Directive limiting output to this crate at this level
    pub fn directive(self) -> String {
        format!("{TARGET}={}", self.to_tracing_level())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(level.directive()))
}

/// Install the fmt subscriber
///
/// Returns false when a global subscriber is already installed, which is
/// the normal case when several suites share one test binary.
pub fn init_logger(level: LogLevel) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
