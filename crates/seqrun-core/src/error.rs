//! Error types shared by every seqrun crate.
//!
//! Distinguishes fatal configuration problems from checkpoint lookup
//! failures and contract violations, and keeps the offending path attached
//! to I/O failures.

use thiserror::Error;

/// Main error type for runner operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RunnerError {
    /// Invalid or unsupported combination of settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Batch size search requested for a batching strategy that cannot be searched.
    #[error("Batch size autotuning is unsupported: {0}")]
    UnsupportedAutotune(String),

    /// No checkpoint record could be resolved from the given location.
    #[error("No checkpoint found in '{0}'")]
    CheckpointNotFound(String),

    /// Averaging was requested over a directory without records.
    #[error("No checkpoints to average in '{0}'")]
    EmptyCheckpointSet(String),

    /// Checkpoint record write/parse failures.
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// An ordered record was pushed twice or after its slot was released.
    #[error("Duplicate index {index} (next expected index is {next_expected})")]
    DuplicateIndex { index: usize, next_expected: usize },

    /// Errors from the candle tensor library.
    #[error("Candle error: {0}")]
    Candle(String),

    /// I/O errors with path context.
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    /// Whether this error reports a bad configuration (never retried).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RunnerError::Configuration(_) | RunnerError::UnsupportedAutotune(_)
        )
    }

    /// Get the path associated with this error (if any).
    pub fn path(&self) -> Option<&str> {
        match self {
            RunnerError::Checkpoint { path, .. } => Some(path),
            RunnerError::Io { path, .. } => Some(path),
            RunnerError::CheckpointNotFound(path) => Some(path),
            RunnerError::EmptyCheckpointSet(path) => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for RunnerError {
    fn from(err: candle_core::Error) -> Self {
        RunnerError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<toml::ser::Error> for RunnerError {
    fn from(err: toml::ser::Error) -> Self {
        RunnerError::Configuration(format!("failed to serialize config: {}", err))
    }
}

/// Helper trait for adding path context to IO operations.
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> Result<T> {
        self.map_err(|e| RunnerError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint errors.
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> RunnerError {
    RunnerError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating config errors.
pub fn config_error(message: impl Into<String>) -> RunnerError {
    RunnerError::Configuration(message.into())
}
