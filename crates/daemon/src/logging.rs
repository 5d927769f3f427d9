use std::fs::File;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot open log file {path}: {source}")]
    OpenLogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the background log writer alive; logs written after this is
/// dropped may be lost.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_level)?),
    }
}

/// Log to stdout and, when `log_file` is given, to that file. The file is
/// truncated so each run starts with a fresh log. `RUST_LOG` overrides
/// `default_level`.
pub fn init(default_level: &str, log_file: Option<&Path>) -> Result<LogGuard, LoggingError> {
    let stdout_layer = fmt::layer().with_target(true).with_level(true).compact();

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = File::create(path).map_err(|source| LoggingError::OpenLogFile {
                path: path.display().to_string(),
                source,
            })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter(default_level)?)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(LogGuard { _file: guard })
}
