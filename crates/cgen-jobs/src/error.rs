//! Job lifecycle errors.

use thiserror::Error;

use cgen_models::{JobStatus, TaskId};
use cgen_queue::QueueError;
use cgen_store::StoreError;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    /// The requested transition is not legal from the job's current state.
    #[error("job {task_id} is {status}: {message}")]
    InvalidState {
        task_id: TaskId,
        status: JobStatus,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl JobError {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, JobError::InvalidState { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::NotFound(_))
    }

    /// Infrastructure errors that the queue should redeliver on.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, JobError::Store(_) | JobError::Queue(_))
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidTransition { task_id, from, to } => JobError::InvalidState {
                task_id,
                status: from,
                message: format!("cannot move to {}", to),
            },
            StoreError::NotFound(what) => JobError::NotFound(what),
            other => JobError::Store(other),
        }
    }
}
