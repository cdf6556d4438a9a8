//! Model error types.

use thiserror::Error;

use crate::job::JobStatus;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Malformed script: {0}")]
    MalformedScript(String),
}

impl ModelError {
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    pub fn malformed_script(msg: impl Into<String>) -> Self {
        Self::MalformedScript(msg.into())
    }
}
