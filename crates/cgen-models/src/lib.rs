//! Shared data models for the generation-job pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Identifiers (task, workspace, project, video, audio track)
//! - The generation job state machine
//! - Video projects, scripts and storyboards
//! - Rendered videos and audio track history
//! - Progress events and client stream frames

pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod project;
pub mod video;

pub use error::{ModelError, ModelResult};
pub use event::{ProgressEvent, StreamFrame};
pub use ids::{AudioTrackId, ProjectId, TaskId, UserId, VideoId, WorkspaceId};
pub use job::{GenerationJob, JobKind, JobRef, JobStatus, JobTable, NewJob, RetryOutcome};
pub use project::{
    reconcile_durations, ProductContext, ProjectStatus, ScriptBundle, ScriptSegment,
    StoryboardScene, VideoProject, DURATION_TOLERANCE_SECS,
};
pub use video::{AudioSettings, AudioTrackStatus, Video, VideoAudioTrack};
