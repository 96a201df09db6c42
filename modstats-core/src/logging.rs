//! Logging infrastructure for modstats
//!
//! Logs are written to `~/.local/state/modstats/modstats.log` following XDG standards.
//! Reporting is a silent best-effort background concern: nothing is ever surfaced
//! to the user, so the log file is the only record of submission outcomes.

use crate::config::{Config, LoggingConfig};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the logging system
///
/// Sets up tracing with:
/// - File output to XDG state directory
/// - Log rotation capped at `max_files` daily files
/// - Configurable log level via config or RUST_LOG env var
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();

    // Create log directory if it doesn't exist
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = build_appender(&log_dir, config)?;

    // Non-blocking writer for better performance
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Build the filter from config or env var
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // File layer - structured logging with timestamps
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    // Initialize the subscriber
    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Daily-rotating file appender that prunes files beyond `max_files`.
fn build_appender(
    log_dir: &std::path::Path,
    config: &LoggingConfig,
) -> crate::error::Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("modstats.log")
        .max_log_files(config.max_files)
        .build(log_dir)
        .map_err(|e| {
            crate::error::Error::Config(format!("failed to initialize log appender: {}", e))
        })
}

/// Initialize logging for tests (logs to stdout)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Returns the log file path
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_file_path() {
        let path = log_file_path();
        assert!(path.ends_with("modstats.log"));
    }

    #[test]
    fn test_appender_applies_max_files_cap() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = LoggingConfig {
            level: "info".to_string(),
            max_files: 2,
        };

        let mut appender = build_appender(dir.path(), &config).unwrap();
        writeln!(appender, "check-in logged").unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }
}
