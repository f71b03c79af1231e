//! Error types for optimistic actions.

use std::time::Duration;

use thiserror::Error;

/// Why an action failed or was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("action {0:?} is already queued")]
    DuplicateId(String),

    #[error("action produced an invalid write: {0}")]
    InvalidWrite(String),

    #[error("no tokio runtime to execute on")]
    NoRuntime,

    #[error("cancelled")]
    Cancelled,

    #[error("action queue disposed")]
    Disposed,
}

impl ActionError {
    pub fn execution(reason: impl std::fmt::Display) -> Self {
        ActionError::Execution(reason.to_string())
    }
}
