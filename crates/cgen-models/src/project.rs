//! Video projects, scripts and storyboards.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, ModelResult};
use crate::ids::{ProjectId, UserId, WorkspaceId};

/// Allowed gap between the summed segment durations and the requested target.
pub const DURATION_TOLERANCE_SECS: f64 = 2.0;

/// Status of the video project aggregate.
///
/// Derived from, but not identical to, its jobs: a project stays
/// `SCRIPT_READY` while a later render job is still `PENDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    #[default]
    Pending,
    Processing,
    ScriptReady,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "PENDING",
            ProjectStatus::Processing => "PROCESSING",
            ProjectStatus::ScriptReady => "SCRIPT_READY",
            ProjectStatus::Completed => "COMPLETED",
            ProjectStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ProjectStatus::Pending),
            "PROCESSING" => Ok(ProjectStatus::Processing),
            "SCRIPT_READY" => Ok(ProjectStatus::ScriptReady),
            "COMPLETED" => Ok(ProjectStatus::Completed),
            "FAILED" => Ok(ProjectStatus::Failed),
            other => Err(ModelError::invalid_value(format!(
                "unknown project status '{}'",
                other
            ))),
        }
    }
}

/// Product the video is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProductContext {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,
}

/// One narrated script segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScriptSegment {
    pub text: String,
    /// Seconds
    pub duration: f64,
}

/// One storyboard scene, aligned index-for-index with the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StoryboardScene {
    pub scene_index: u32,
    /// Seconds
    pub duration: f64,
    pub visual_prompt: String,
    #[serde(default = "default_transition")]
    pub transition: String,
}

fn default_transition() -> String {
    "cut".to_string()
}

/// Output of the script stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScriptBundle {
    pub script: Vec<ScriptSegment>,
    pub storyboard: Vec<StoryboardScene>,
}

impl ScriptBundle {
    pub fn script_duration(&self) -> f64 {
        self.script.iter().map(|s| s.duration).sum()
    }

    pub fn storyboard_duration(&self) -> f64 {
        self.storyboard.iter().map(|s| s.duration).sum()
    }

    /// Both sums within tolerance of `target` and equal to each other.
    pub fn is_aligned(&self, target: f64) -> bool {
        let script = self.script_duration();
        let storyboard = self.storyboard_duration();
        (script - target).abs() <= DURATION_TOLERANCE_SECS
            && (storyboard - target).abs() <= DURATION_TOLERANCE_SECS
            && (script - storyboard).abs() < 1e-6
    }

    /// Rescale generator output so both tracks sum to `target` with
    /// identical per-index durations. Rejects malformed output.
    pub fn reconcile(mut self, target: f64) -> ModelResult<Self> {
        if self.script.len() != self.storyboard.len() {
            return Err(ModelError::malformed_script(format!(
                "script has {} segments but storyboard has {} scenes",
                self.script.len(),
                self.storyboard.len()
            )));
        }

        let raw: Vec<f64> = self.script.iter().map(|s| s.duration).collect();
        let durations = reconcile_durations(&raw, target)?;

        for (i, (segment, scene)) in self
            .script
            .iter_mut()
            .zip(self.storyboard.iter_mut())
            .enumerate()
        {
            segment.duration = durations[i];
            scene.duration = durations[i];
            scene.scene_index = i as u32;
        }
        Ok(self)
    }
}

/// Scale `segments` proportionally so they sum to `target`.
///
/// Durations are rounded to 0.1s; the last segment absorbs the rounding
/// remainder so the sum is exact.
pub fn reconcile_durations(segments: &[f64], target: f64) -> ModelResult<Vec<f64>> {
    if segments.len() < 2 {
        return Err(ModelError::malformed_script(format!(
            "expected at least 2 segments, got {}",
            segments.len()
        )));
    }
    if !(target.is_finite() && target > 0.0) {
        return Err(ModelError::malformed_script(format!(
            "target duration must be positive, got {}",
            target
        )));
    }
    if let Some((i, d)) = segments
        .iter()
        .enumerate()
        .find(|(_, d)| !(d.is_finite() && **d > 0.0))
    {
        return Err(ModelError::malformed_script(format!(
            "segment {} has non-positive duration {}",
            i, d
        )));
    }

    let total: f64 = segments.iter().sum();
    let scale = target / total;
    let last = segments.len() - 1;

    let mut out: Vec<f64> = segments[..last]
        .iter()
        .map(|d| ((d * scale) * 10.0).round() / 10.0)
        .collect();
    if let Some(i) = out.iter().position(|d| *d <= 0.0) {
        return Err(ModelError::malformed_script(format!(
            "segment {} rounds to zero at target {}s",
            i, target
        )));
    }
    let head: f64 = out.iter().sum();
    let remainder = ((target - head) * 100.0).round() / 100.0;
    if remainder <= 0.0 {
        return Err(ModelError::malformed_script(
            "segment durations cannot be reconciled with target",
        ));
    }
    out.push(remainder);
    Ok(out)
}

/// Video project (parent aggregate).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VideoProject {
    pub id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub product: ProductContext,
    /// Requested length in seconds
    pub target_duration: u32,
    pub status: ProjectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<Vec<ScriptSegment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storyboard: Option<Vec<StoryboardScene>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoProject {
    pub fn new(
        workspace_id: WorkspaceId,
        user_id: UserId,
        product: ProductContext,
        target_duration: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            workspace_id,
            user_id,
            product,
            target_duration,
            status: ProjectStatus::Pending,
            script: None,
            storyboard: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Script and storyboard both present and non-empty.
    pub fn has_script(&self) -> bool {
        matches!((&self.script, &self.storyboard), (Some(s), Some(b)) if !s.is_empty() && !b.is_empty())
    }

    /// Concatenated narration text, used for speech synthesis.
    pub fn narration(&self) -> Option<String> {
        self.script.as_ref().map(|segments| {
            segments
                .iter()
                .map(|s| s.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
    }
}
