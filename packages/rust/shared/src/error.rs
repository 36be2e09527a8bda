//! Error types for genpipe.
//!
//! Library crates use [`GenPipeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all genpipe operations.
#[derive(Debug, thiserror::Error)]
pub enum GenPipeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an external collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed payload from a collaborator or on disk.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad descriptor shape, overlapping keyword sets, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A generation stage or external call returned an error.
    #[error("{stage} failed: {message}")]
    Protocol { stage: String, message: String },

    /// A blocking call exceeded its time budget.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// The caller cancelled the session.
    #[error("session cancelled")]
    Cancelled,

    /// The legacy path failed; no further degradation exists.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GenPipeError>;

impl GenPipeError {
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

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a stage failure.
    pub fn protocol(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Protocol {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, budget: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds: budget.as_secs(),
        }
    }

    /// Whether this error is one of the two stage-failure kinds the
    /// decision function handles identically.
    pub fn is_stage_failure(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Timeout { .. })
    }
}
