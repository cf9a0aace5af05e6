//! Engine error types.

use rstflow_core::CoreError;
use rstflow_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the workflow manager and its helpers.
///
/// Core and storage errors pass through unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to load definition '{}': {reason}", .path.display())]
    Load { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Core(e) => e.error_code(),
            EngineError::Store(e) => e.error_code(),
            EngineError::Load { .. } => "INVALID_DEFINITION",
            EngineError::Io(_) => "IO_ERROR",
        }
    }

    /// Only storage I/O and lock-wait timeouts are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
