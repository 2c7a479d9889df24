//! Tracing subscriber setup.
//!
//! Interactive commands log to stderr. Hook invocations log to a file, since
//! the host reads the hook's stderr as the block explanation.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Environment variable holding a filter directive that overrides config.
pub const LOG_ENV: &str = "ERRLOOP_LOG";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("cannot open log file {path}: {reason}")]
    LogFile { path: String, reason: String },

    #[error("global subscriber already set")]
    AlreadyInitialized,
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    File(PathBuf),
}

/// Filter directive for a `-v` count, or `None` to defer to config.
fn verbosity_directive(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Resolve the filter: `ERRLOOP_LOG`, then `-v`, then the configured level.
pub fn build_filter(config: &LoggingConfig, verbose: u8) -> Result<EnvFilter, LoggingError> {
    let directive = std::env::var(LOG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| verbosity_directive(verbose).map(str::to_string))
        .unwrap_or_else(|| config.level.clone());
    EnvFilter::try_new(&directive).map_err(|e| LoggingError::InvalidFilter {
        directive,
        reason: e.to_string(),
    })
}

fn boxed_layer<W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(false)
            .boxed(),
    }
}

/// Install the global subscriber.
pub fn init_logging(config: &LoggingConfig, verbose: u8, sink: &LogSink) -> Result<(), LoggingError> {
    let filter = build_filter(config, verbose)?;

    let layer = match sink {
        LogSink::Stderr => boxed_layer(config.format, std::io::stderr, true),
        LogSink::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| LoggingError::LogFile {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| LoggingError::LogFile {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            boxed_layer(config.format, Mutex::new(file), false)
        }
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}
