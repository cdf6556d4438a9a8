//! Worker error types.

use thiserror::Error;

use cgen_jobs::JobError;
use cgen_media::MediaError;
use cgen_models::ModelError;
use cgen_providers::ProviderError;
use cgen_queue::QueueError;
use cgen_storage::StorageError;
use cgen_store::StoreError;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failure of the executor itself. Returned errors leave the delivery
/// unacked so the queue redelivers it.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The stage was cut short by worker shutdown; the job is left for
    /// redelivery.
    #[error("Interrupted by shutdown: {0}")]
    Interrupted(String),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

/// Failure of one stage invocation. Its display text becomes the job's
/// `error_message`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("timeout: stage exceeded {0}s")]
    Timeout(u64),

    /// Stage input does not satisfy the stage's requirements.
    #[error("{0}")]
    Precondition(String),

    #[error("invalid stage parameters: {0}")]
    InvalidParams(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("malformed generator output: {0}")]
    Model(#[from] ModelError),

    #[error("remux failed: {}", .0.describe())]
    Media(#[from] MediaError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job error: {0}")]
    Job(#[from] JobError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StageError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Timeout(_))
    }

    /// Transient failures worth another in-process attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Provider(e) => e.is_retryable(),
            StageError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        StageError::Job(err.into())
    }
}
