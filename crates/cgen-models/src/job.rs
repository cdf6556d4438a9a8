//! Generation job definitions and the job state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, ModelResult};
use crate::ids::{AudioTrackId, ProjectId, TaskId, UserId, VideoId, WorkspaceId};

/// Persisted status of a generation job.
///
/// Legal transitions:
/// `PENDING -> PROCESSING -> {COMPLETED, FAILED}`, `PENDING -> FAILED`
/// and `FAILED -> PENDING` (retry). `PROCESSING -> PROCESSING` is accepted
/// as an idempotent start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Pending, Failed)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }

    pub fn ensure_transition(&self, next: JobStatus) -> ModelResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ModelError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }

    /// Retry is allowed only from FAILED unless an operator forces it.
    pub fn can_retry(&self, force: bool) -> bool {
        force || *self == JobStatus::Failed
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(ModelError::invalid_value(format!("unknown job status '{}'", other))),
        }
    }
}

/// Physical table a job lives in. Doubles as the `task_type` discriminator
/// on operator and streaming endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobTable {
    Copy,
    Image,
    Video,
}

impl JobTable {
    pub const ALL: [JobTable; 3] = [JobTable::Copy, JobTable::Image, JobTable::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobTable::Copy => "copy",
            JobTable::Image => "image",
            JobTable::Video => "video",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            JobTable::Copy => "copy_generation_jobs",
            JobTable::Image => "image_generation_jobs",
            JobTable::Video => "video_generation_jobs",
        }
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobTable {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "copy" => Ok(JobTable::Copy),
            "image" => Ok(JobTable::Image),
            "video" => Ok(JobTable::Video),
            other => Err(ModelError::invalid_value(format!("unknown task type '{}'", other))),
        }
    }
}

/// Pipeline stage a job record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Copy,
    Image,
    VideoScript,
    VideoRender,
    AudioRegeneration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Copy => "copy",
            JobKind::Image => "image",
            JobKind::VideoScript => "video_script",
            JobKind::VideoRender => "video_render",
            JobKind::AudioRegeneration => "audio_regeneration",
        }
    }

    pub fn table(&self) -> JobTable {
        match self {
            JobKind::Copy => JobTable::Copy,
            JobKind::Image => JobTable::Image,
            JobKind::VideoScript | JobKind::VideoRender | JobKind::AudioRegeneration => {
                JobTable::Video
            }
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(JobKind::Copy),
            "image" => Ok(JobKind::Image),
            "video_script" => Ok(JobKind::VideoScript),
            "video_render" => Ok(JobKind::VideoRender),
            "audio_regeneration" => Ok(JobKind::AudioRegeneration),
            other => Err(ModelError::invalid_value(format!("unknown job kind '{}'", other))),
        }
    }
}

/// Fully qualified address of a job row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct JobRef {
    pub table: JobTable,
    pub workspace_id: WorkspaceId,
    pub task_id: TaskId,
}

impl JobRef {
    pub fn new(table: JobTable, workspace_id: WorkspaceId, task_id: TaskId) -> Self {
        Self {
            table,
            workspace_id,
            task_id,
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.task_id)
    }
}

/// Input for inserting a new PENDING job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub task_id: TaskId,
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub generation_config: Value,
    pub project_id: Option<ProjectId>,
    pub video_id: Option<VideoId>,
}

impl NewJob {
    pub fn new(
        workspace_id: WorkspaceId,
        user_id: UserId,
        kind: JobKind,
        generation_config: Value,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            workspace_id,
            user_id,
            kind,
            generation_config,
            project_id: None,
            video_id: None,
        }
    }

    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_video(mut self, video_id: VideoId) -> Self {
        self.video_id = Some(video_id);
        self
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef::new(self.kind.table(), self.workspace_id.clone(), self.task_id.clone())
    }
}

/// A persisted generation job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GenerationJob {
    /// Internal primary key
    #[serde(skip)]
    pub id: i64,

    /// External correlation id (pub/sub key)
    pub task_id: TaskId,

    pub workspace_id: WorkspaceId,

    pub user_id: UserId,

    pub kind: JobKind,

    pub status: JobStatus,

    /// Progress (0-100)
    pub progress: u8,

    /// Last progress message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    /// Error message (only when FAILED)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Stage parameters for the external generation call
    pub generation_config: Value,

    /// Stage output, written once on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_results: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<VideoId>,

    /// Number of retries applied to this row
    #[serde(default)]
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn job_ref(&self) -> JobRef {
        JobRef::new(self.kind.table(), self.workspace_id.clone(), self.task_id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `progress == 100` if and only if the job is COMPLETED.
    pub fn progress_consistent(&self) -> bool {
        (self.progress == 100) == (self.status == JobStatus::Completed)
    }

    /// Track an audio regeneration job writes, from its generation config.
    pub fn audio_track_id(&self) -> Option<AudioTrackId> {
        self.generation_config
            .get("audio_track_id")
            .and_then(Value::as_str)
            .map(AudioTrackId::from)
    }
}

/// Result of an operator retry request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryOutcome {
    pub success: bool,
    pub old_status: JobStatus,
    pub new_status: JobStatus,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        use JobStatus::*;
        let illegal = [
            (Completed, Processing),
            (Completed, Pending),
            (Completed, Failed),
            (Failed, Processing),
            (Failed, Completed),
            (Pending, Completed),
            (Processing, Pending),
        ];
        for (from, to) in illegal {
            assert_eq!(
                from.ensure_transition(to),
                Err(ModelError::InvalidTransition { from, to }),
                "{} -> {} must be rejected",
                from,
                to
            );
        }
    }

    #[test]
    fn test_retry_requires_failed_unless_forced() {
        assert!(JobStatus::Failed.can_retry(false));
        assert!(!JobStatus::Processing.can_retry(false));
        assert!(!JobStatus::Completed.can_retry(false));
        assert!(JobStatus::Completed.can_retry(true));
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"PROCESSING\""
        );
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }

    #[test]
    fn test_kind_maps_to_table() {
        assert_eq!(JobKind::AudioRegeneration.table(), JobTable::Video);
        assert_eq!(JobKind::Copy.table().table_name(), "copy_generation_jobs");
        assert!("video_edit".parse::<JobTable>().is_err());
    }

    #[test]
    fn test_new_job_ref() {
        let job = NewJob::new(
            WorkspaceId::from("ws"),
            UserId::from("u"),
            JobKind::VideoRender,
            serde_json::json!({}),
        );
        let job_ref = job.job_ref();
        assert_eq!(job_ref.table, JobTable::Video);
        assert_eq!(job_ref.task_id, job.task_id);
    }
}
