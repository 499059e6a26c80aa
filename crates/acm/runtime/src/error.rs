//! Error types for acmd

use acm_supervision::SupervisionError;
use thiserror::Error;

/// Runtime-level errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Supervision engine error
    #[error("Supervision error: {0}")]
    Supervision(#[from] SupervisionError),

    /// Demo scenario did not reach the expected state
    #[error("Demo error: {0}")]
    Demo(String),
}

impl From<config::ConfigError> for RuntimeError {
    fn from(e: config::ConfigError) -> Self {
        RuntimeError::Config(e.to_string())
    }
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
