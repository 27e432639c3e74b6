//! Logging setup for hosts embedding the realtime core.
//!
//! The core itself only emits `tracing` events. Hosts without their own
//! subscriber can install this one:
//! - daily rotating files under the data directory
//! - console output, and console only if the log directory is unusable
//! - `TIDEPOOL_LOG` or `RUST_LOG` override the build-type default filter

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "TIDEPOOL_LOG";

/// Where and how to log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for rotated log files
    pub log_dir: PathBuf,
    /// Interactive terminal; logs go to stdout only
    pub is_pty: bool,
    /// Filter overriding the environment and defaults
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Log into `log_dir`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_pty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Use a fixed filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Keeps the file writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Falls back to console-only output when the log directory cannot be used.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.is_pty {
        return init_stdout_logging(config.log_filter.as_deref());
    }

    match init_file_logging(&config) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!(
                "Warning: could not log to {}: {}. Logging to console only.",
                config.log_dir.display(),
                e
            );
            init_stdout_logging(config.log_filter.as_deref())
        }
    }
}

/// Install the global subscriber with the default log directory.
pub fn init_logging_default() -> LoggingGuard {
    init_logging(LogConfig::new(log_dir()))
}

fn init_stdout_logging(filter: Option<&str>) -> LoggingGuard {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(filter))
        .with_ansi(true)
        .with_target(false)
        .try_init();

    LoggingGuard { _worker_guard: None }
}

fn init_file_logging(config: &LogConfig) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("tidepool")
        .filename_suffix("log")
        .build(&config.log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let writer = std::io::stdout.with_max_level(tracing::Level::INFO).and(file_writer);

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(build_env_filter(config.log_filter.as_deref()))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    Ok(guard)
}

/// Custom filter, then `TIDEPOOL_LOG`, then `RUST_LOG`, then the default.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Default filter for the current build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "info,tidepool_core=debug,tidepool_core::services::dispatch=trace"
    }
    #[cfg(not(debug_assertions))]
    {
        "warn,tidepool_core=info"
    }
}

/// Default log directory.
pub fn log_dir() -> PathBuf {
    crate::config::default_data_dir().join("logs")
}
