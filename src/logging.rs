use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Write `<run_dir>/logs/training.log` instead of stdout.
    pub to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            to_file: true,
        }
    }
}

/// Install the global subscriber for one run.
///
/// Logs go to stdout when `verbose` is set or file logging is disabled,
/// otherwise to a non-blocking writer under `<run_dir>/logs`. The returned
/// guard must be held until the run ends so buffered records get flushed.
pub fn init(
    config: &LoggingConfig,
    run_dir: &Path,
    verbose: bool,
) -> std::io::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if verbose || !config.to_file {
        let result = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
        if result.is_err() {
            tracing::debug!("global subscriber already installed");
        }
        return Ok(None);
    }

    let log_dir = run_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::never(&log_dir, "training.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
    Ok(Some(guard))
}
