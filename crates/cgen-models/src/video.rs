//! Rendered videos and audio track history.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;
use crate::ids::{AudioTrackId, ProjectId, TaskId, VideoId, WorkspaceId};

/// Rendered video artifact of a project. A project may be re-rendered.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Video {
    pub id: VideoId,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_task_id: Option<TaskId>,
    /// Absent until a render artifact exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_audio_track_id: Option<AudioTrackId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    pub fn has_artifact(&self) -> bool {
        self.video_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioTrackStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AudioTrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioTrackStatus::Pending => "pending",
            AudioTrackStatus::Processing => "processing",
            AudioTrackStatus::Completed => "completed",
            AudioTrackStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AudioTrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AudioTrackStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AudioTrackStatus::Pending),
            "processing" => Ok(AudioTrackStatus::Processing),
            "completed" => Ok(AudioTrackStatus::Completed),
            "failed" => Ok(AudioTrackStatus::Failed),
            other => Err(ModelError::invalid_value(format!(
                "unknown audio track status '{}'",
                other
            ))),
        }
    }
}

/// Voice settings for one audio regeneration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AudioSettings {
    pub voice: String,
    /// Playback rate, 1.0 = normal
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Linear gain, 1.0 = unchanged
    #[serde(default = "default_volume")]
    pub volume: f64,
}

fn default_speed() -> f64 {
    1.0
}

fn default_volume() -> f64 {
    1.0
}

impl AudioSettings {
    /// Whether a loudness pass is needed before remuxing.
    pub fn adjusts_volume(&self) -> bool {
        (self.volume - 1.0).abs() > f64::EPSILON
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            voice: "default".to_string(),
            speed: default_speed(),
            volume: default_volume(),
        }
    }
}

/// One TTS regeneration attempt for a video.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VideoAudioTrack {
    pub id: AudioTrackId,
    pub workspace_id: WorkspaceId,
    pub video_id: VideoId,
    #[serde(flatten)]
    pub settings: AudioSettings,
    pub status: AudioTrackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_settings_defaults() {
        let settings: AudioSettings = serde_json::from_str(r#"{"voice":"nova"}"#).unwrap();
        assert_eq!(settings.speed, 1.0);
        assert!(!settings.adjusts_volume());

        let louder = AudioSettings {
            volume: 1.5,
            ..settings
        };
        assert!(louder.adjusts_volume());
    }

    #[test]
    fn test_track_status_round_trip() {
        assert_eq!(
            "completed".parse::<AudioTrackStatus>().unwrap(),
            AudioTrackStatus::Completed
        );
        assert!("done".parse::<AudioTrackStatus>().is_err());
    }
}
