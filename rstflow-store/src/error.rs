//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out after {waited_ms}ms waiting for row lock on {table}/{id}")]
    LockTimeout {
        table: String,
        id: String,
        waited_ms: u64,
    },

    #[error("journal corrupted at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("journal {} is poisoned by a failed append that could not be undone", .path.display())]
    JournalPoisoned { path: PathBuf },
}

impl StoreError {
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::Io(_) => "STORAGE_IO",
            StoreError::Json(_) => "STORAGE_FORMAT",
            StoreError::LockTimeout { .. } => "LOCK_TIMEOUT",
            StoreError::Corruption { .. } => "CORRUPTION",
            StoreError::RecordTooLarge { .. } => "RECORD_TOO_LARGE",
            StoreError::JournalPoisoned { .. } => "JOURNAL_POISONED",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::LockTimeout { .. })
    }
}
