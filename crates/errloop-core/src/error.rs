//! Error types for errloop-core.
//!
//! The decision paths (matching, classification, merging) never surface these
//! to the host agent; they exist so that I/O and parse problems can be logged
//! with context and so the CLI can report them to a human.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("pack error: {0}")]
    Pack(#[from] PackError),

    #[error("lock error: {0}")]
    Lock(#[from] crate::lock::LockError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration loading and editing failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(String, String),

    #[error("failed to parse config: {0}")]
    ParseFailed(String),

    #[error("invalid config: {0}")]
    ValidationError(String),
}

/// Ledger read/append failures.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to append to {path}: {reason}")]
    AppendFailed { path: String, reason: String },

    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("malformed ledger line: {0}")]
    MalformedLine(String),
}

/// Rule pack loading and persistence failures.
#[derive(Error, Debug)]
pub enum PackError {
    #[error("pack not found: {0}")]
    PackNotFound(String),

    #[error("invalid pack {name}: {reason}")]
    InvalidPack { name: String, reason: String },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("failed to write {path}: {reason}")]
    WriteFailed { path: String, reason: String },
}
