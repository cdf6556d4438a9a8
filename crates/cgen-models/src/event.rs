//! Progress events and client stream frames.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::TaskId;
use crate::job::{GenerationJob, JobStatus};

/// Message published on the progress channel of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Stage output, terminal success events only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(
        task_id: TaskId,
        status: JobStatus,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            status,
            progress: progress.min(100),
            message: message.into(),
            timestamp: Utc::now(),
            results: None,
            error: None,
        }
    }

    pub fn completed(task_id: TaskId, results: Value) -> Self {
        Self {
            results: Some(results),
            ..Self::new(task_id, JobStatus::Completed, 100, "completed")
        }
    }

    pub fn failed(task_id: TaskId, progress: u8, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            error: Some(error.clone()),
            ..Self::new(task_id, JobStatus::Failed, progress, error)
        }
    }

    /// Event mirroring the persisted state of `job`.
    pub fn snapshot(job: &GenerationJob) -> Self {
        let message = match job.status {
            JobStatus::Failed => job.error_message.clone().unwrap_or_default(),
            _ => job
                .current_step
                .clone()
                .unwrap_or_else(|| job.status.as_str().to_ascii_lowercase()),
        };
        Self {
            task_id: job.task_id.clone(),
            status: job.status,
            progress: job.progress,
            message,
            timestamp: job.updated_at,
            results: job.raw_results.clone(),
            error: job.error_message.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Frame written to a long-lived client stream (SSE or WebSocket).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Current persisted state, always the first frame
    Snapshot(ProgressEvent),

    /// Live event forwarded from the bus
    Progress(ProgressEvent),

    /// Synthetic end-of-stream marker
    Closed { task_id: TaskId, status: JobStatus },
}

impl StreamFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamFrame::Snapshot(_) => "snapshot",
            StreamFrame::Progress(_) => "progress",
            StreamFrame::Closed { .. } => "closed",
        }
    }

    /// Payload without the `type` tag, used as SSE `data`.
    pub fn data(&self) -> Value {
        match self {
            StreamFrame::Snapshot(event) | StreamFrame::Progress(event) => {
                serde_json::to_value(event).unwrap_or(Value::Null)
            }
            StreamFrame::Closed { task_id, status } => {
                serde_json::json!({ "task_id": task_id, "status": status })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamFrame::Closed { .. })
    }
}
