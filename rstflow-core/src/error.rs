//! Core error types.

use thiserror::Error;

/// Error type returned by user-supplied actions.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from the workflow core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid workflow definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("guard on '{transition}' returned a non-boolean value: {value}")]
    GuardContract { transition: String, value: String },

    #[error("transition depth exceeded for instance '{instance_id}': depth {depth} > max {max}")]
    RecursionLimit {
        instance_id: String,
        depth: u32,
        max: u32,
    },

    #[error("invalid snapshot for instance '{instance_id}': {reason}")]
    InvalidSnapshot { instance_id: String, reason: String },

    #[error("action failed on '{transition}': {source}")]
    Action {
        transition: String,
        #[source]
        source: ActionError,
    },

    #[error("workflow type not registered: {type_name}")]
    TypeNotFound { type_name: String },

    #[error("workflow type already registered: {type_name}")]
    DuplicateType { type_name: String },
}

impl CoreError {
    /// Returns an error code suitable for logs and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::InvalidGuard { .. } => "INVALID_DEFINITION",
            CoreError::GuardContract { .. } => "GUARD_CONTRACT",
            CoreError::RecursionLimit { .. } => "RECURSION_LIMIT",
            CoreError::InvalidSnapshot { .. } => "INVALID_SNAPSHOT",
            CoreError::Action { .. } => "ACTION_FAILED",
            CoreError::TypeNotFound { .. } => "TYPE_NOT_FOUND",
            CoreError::DuplicateType { .. } => "DUPLICATE_TYPE",
        }
    }
}
