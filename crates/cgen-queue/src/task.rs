//! Stage task envelope carried by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use cgen_models::{JobKind, JobRef, TaskId};

/// Pipeline stage a task invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    Render,
    AudioRegeneration,
    Copy,
    Image,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Script => "script",
            Stage::Render => "render",
            Stage::AudioRegeneration => "audio_regeneration",
            Stage::Copy => "copy",
            Stage::Image => "image",
        }
    }

    /// Stage that processes jobs of `kind`.
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::VideoScript => Stage::Script,
            JobKind::VideoRender => Stage::Render,
            JobKind::AudioRegeneration => Stage::AudioRegeneration,
            JobKind::Copy => Stage::Copy,
            JobKind::Image => Stage::Image,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `(stage, job, params)` unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTask {
    pub stage: Stage,
    pub job: JobRef,
    /// `retry_count` of the job row when this task was enqueued
    #[serde(default)]
    pub retry_generation: u32,
    #[serde(default)]
    pub params: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl StageTask {
    pub fn new(stage: Stage, job: JobRef, retry_generation: u32, params: Value) -> Self {
        Self {
            stage,
            job,
            retry_generation,
            params,
            enqueued_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.job.task_id
    }

    /// Key used to deduplicate enqueues. A retry bumps the generation, so
    /// the retried task is never mistaken for the original.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.stage, self.job.task_id, self.retry_generation
        )
    }
}

/// A task handed to one consumer, identified by its message id.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub task: StageTask,
}
