//! Error types for Shelfscrape.
//!
//! Library crates use [`ShelfscrapeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Shelfscrape operations.
#[derive(Debug, thiserror::Error)]
pub enum ShelfscrapeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside the render boundary.
    #[error("network error: {0}")]
    Network(String),

    /// Page rendering failure reported by the renderer collaborator.
    #[error("render error: {0}")]
    Render(String),

    /// Language-model collaborator error (API, rate limit, malformed
    /// output). `retryable` carries the model crate's classification so the
    /// orchestrator does not back off on permanent failures.
    #[error("model error: {message}")]
    Model { message: String, retryable: bool },

    /// HTML parsing or selector error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Data validation error (empty schema, rejected record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ShelfscrapeError>;

impl ShelfscrapeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a model error, preserving the collaborator's retryability.
    pub fn model(msg: impl Into<String>, retryable: bool) -> Self {
        Self::Model {
            message: msg.into(),
            retryable,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
