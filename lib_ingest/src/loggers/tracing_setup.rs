//! # Logging Setup
//!
//! Installs the global `tracing` subscriber:
//! - an `EnvFilter` built from `RUST_LOG` when set, else from `LOG_LEVEL`;
//! - a console layer, plain text or JSON;
//! - optionally a JSON file layer rotated daily under `LOG_DIR`.
//!
//! The returned `WorkerGuard` flushes the file writer when dropped, so the
//! caller must keep it alive until exit.

use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::configs::{LogConfig, LogFormat};

const LOG_FILE_PREFIX: &str = "server_ingest.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("cannot create log directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("a global subscriber is already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Builds the filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|source| LoggingError::Filter {
        filter: level.to_string(),
        source,
    })
}

pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = env_filter(&config.level)?;

    let console: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
    };

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let (writer, guard) = file_writer(dir)?;
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .try_init()?;

    tracing::info!(level = %config.level, format = ?config.format, dir = ?config.dir, "logging initialized");
    Ok(guard)
}

fn file_writer(dir: &Path) -> Result<(non_blocking::NonBlocking, WorkerGuard), LoggingError> {
    std::fs::create_dir_all(dir)?;
    let appender = rolling::daily(dir, LOG_FILE_PREFIX);
    Ok(non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(env_filter("info,lib_ingest=debug").is_ok());
        assert!(matches!(env_filter("lib_ingest=notalevel"), Err(LoggingError::Filter { .. })));
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        let (_writer, _guard) = file_writer(&dir).unwrap();
        assert!(dir.is_dir());
    }
}
