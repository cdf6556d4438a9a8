//! Database row models and their conversion into domain types.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that string
//! comparison in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use sqlx::FromRow;

use cgen_models::{
    AudioSettings, AudioTrackId, GenerationJob, ProjectId, TaskId, UserId, Video,
    VideoAudioTrack, VideoId, VideoProject, WorkspaceId,
};

use crate::error::{StoreError, StoreResult};

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now() -> String {
    format_ts(Utc::now())
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_json<T: DeserializeOwned>(s: &str) -> StoreResult<T> {
    Ok(serde_json::from_str(s)?)
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub task_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub kind: String,
    pub status: String,
    pub progress: i64,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
    pub generation_config: String,
    pub raw_results: Option<String>,
    pub project_id: Option<String>,
    pub video_id: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> StoreResult<Self> {
        Ok(GenerationJob {
            id: row.id,
            task_id: TaskId::from(row.task_id),
            workspace_id: WorkspaceId::from(row.workspace_id),
            user_id: UserId::from(row.user_id),
            kind: row.kind.parse()?,
            status: row.status.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            current_step: row.current_step,
            error_message: row.error_message,
            generation_config: parse_json(&row.generation_config)?,
            raw_results: row.raw_results.as_deref().map(parse_json).transpose()?,
            project_id: row.project_id.map(ProjectId::from),
            video_id: row.video_id.map(VideoId::from),
            retry_count: row.retry_count.max(0) as u32,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            started_at: parse_opt_ts(row.started_at)?,
            completed_at: parse_opt_ts(row.completed_at)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ProjectRow {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub product: String,
    pub target_duration: i64,
    pub status: String,
    pub script: Option<String>,
    pub storyboard: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ProjectRow> for VideoProject {
    type Error = StoreError;

    fn try_from(row: ProjectRow) -> StoreResult<Self> {
        Ok(VideoProject {
            id: ProjectId::from(row.id),
            workspace_id: WorkspaceId::from(row.workspace_id),
            user_id: UserId::from(row.user_id),
            product: parse_json(&row.product)?,
            target_duration: row.target_duration.max(0) as u32,
            status: row.status.parse()?,
            script: row.script.as_deref().map(parse_json).transpose()?,
            storyboard: row.storyboard.as_deref().map(parse_json).transpose()?,
            error_message: row.error_message,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct VideoRow {
    pub id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub render_task_id: Option<String>,
    pub video_url: Option<String>,
    pub provider: String,
    pub duration: Option<f64>,
    pub current_audio_track_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<VideoRow> for Video {
    type Error = StoreError;

    fn try_from(row: VideoRow) -> StoreResult<Self> {
        Ok(Video {
            id: VideoId::from(row.id),
            workspace_id: WorkspaceId::from(row.workspace_id),
            project_id: ProjectId::from(row.project_id),
            render_task_id: row.render_task_id.map(TaskId::from),
            video_url: row.video_url,
            provider: row.provider,
            duration: row.duration,
            current_audio_track_id: row.current_audio_track_id.map(AudioTrackId::from),
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct AudioTrackRow {
    pub id: String,
    pub workspace_id: String,
    pub video_id: String,
    pub voice: String,
    pub speed: f64,
    pub volume: f64,
    pub status: String,
    pub audio_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<AudioTrackRow> for VideoAudioTrack {
    type Error = StoreError;

    fn try_from(row: AudioTrackRow) -> StoreResult<Self> {
        Ok(VideoAudioTrack {
            id: AudioTrackId::from(row.id),
            workspace_id: WorkspaceId::from(row.workspace_id),
            video_id: VideoId::from(row.video_id),
            settings: AudioSettings {
                voice: row.voice,
                speed: row.speed,
                volume: row.volume,
            },
            status: row.status.parse()?,
            audio_url: row.audio_url,
            error_message: row.error_message,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let earlier = format_ts(Utc::now() - chrono::TimeDelta::seconds(5));
        let later = now();
        assert!(earlier < later);
        assert_eq!(later.len(), earlier.len());
        assert!(parse_ts(&later).is_ok());
    }
}
