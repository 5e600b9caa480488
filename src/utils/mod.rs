//! Shared utilities

pub mod logger;

pub use logger::{init_logger, LogLevel, LOG_ENV_VAR};
