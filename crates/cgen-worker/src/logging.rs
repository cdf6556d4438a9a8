//! Structured job logging.
//!
//! Consistent lifecycle lines and a span carrying the task id, workspace
//! and stage of one invocation.

use tracing::{error, info, warn, Span};

use cgen_queue::StageTask;

#[derive(Debug, Clone)]
pub struct JobLogger {
    task_id: String,
    workspace_id: String,
    stage: String,
}

impl JobLogger {
    pub fn new(task: &StageTask) -> Self {
        Self {
            task_id: task.job.task_id.to_string(),
            workspace_id: task.job.workspace_id.to_string(),
            stage: task.stage.as_str().to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            task_id = %self.task_id,
            workspace_id = %self.workspace_id,
            stage = %self.stage,
            "Stage started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            task_id = %self.task_id,
            stage = %self.stage,
            "Stage progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            task_id = %self.task_id,
            stage = %self.stage,
            "Stage warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            task_id = %self.task_id,
            workspace_id = %self.workspace_id,
            stage = %self.stage,
            "Stage failed: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            task_id = %self.task_id,
            stage = %self.stage,
            "Stage completed: {}", message
        );
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "stage",
            task_id = %self.task_id,
            workspace_id = %self.workspace_id,
            stage = %self.stage
        )
    }
}
