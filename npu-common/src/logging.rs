//! Process-wide tracing setup.

use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// File name prefix for the rolling log files.
const LOG_FILE_PREFIX: &str = "npud.log";

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Force `debug` regardless of `level`.
    pub verbose: bool,
    /// Emit JSON lines instead of the human format.
    pub json: bool,
    /// Also write daily-rotated logs into this directory.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Keeps the non-blocking file writer flushing; drop it last.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

fn build_filter(opts: &LoggingOptions) -> EnvFilter {
    if opts.verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if opts.level.is_empty() { "info" } else { opts.level.as_str() };
        EnvFilter::new(level)
    })
}

/// Install the global subscriber.
pub fn init_logging(opts: &LoggingOptions) -> Result<LoggingGuard, LoggingError> {
    let (file_layer, guard) = match &opts.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::LogDir {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let human = (!opts.json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));
    let json = opts
        .json
        .then(|| fmt::layer().json().with_current_span(false).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(build_filter(opts))
        .with(human)
        .with(json)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;

    Ok(LoggingGuard { _file: guard })
}
