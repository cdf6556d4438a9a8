//! Rendering capability interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cgen_models::{
    GenerationJob, ProductContext, ProjectId, ScriptSegment, StoryboardScene, TaskId, VideoProject,
    WorkspaceId,
};

use crate::error::{ProviderError, ProviderResult};

/// Everything a provider needs to render one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub task_id: TaskId,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    pub product: ProductContext,
    pub target_duration: u32,
    pub script: Vec<ScriptSegment>,
    pub storyboard: Vec<StoryboardScene>,
    /// Stage parameters from the job's generation config
    #[serde(default)]
    pub options: Value,
}

impl RenderRequest {
    /// Build from the render job and its project. The project must carry a
    /// script and storyboard.
    pub fn from_project(job: &GenerationJob, project: &VideoProject) -> ProviderResult<Self> {
        let (script, storyboard) = match (&project.script, &project.storyboard) {
            (Some(script), Some(storyboard)) if !script.is_empty() && !storyboard.is_empty() => {
                (script.clone(), storyboard.clone())
            }
            _ => {
                return Err(ProviderError::Config(format!(
                    "project {} has no script or storyboard",
                    project.id
                )))
            }
        };
        Ok(Self {
            task_id: job.task_id.clone(),
            workspace_id: job.workspace_id.clone(),
            project_id: project.id.clone(),
            product: project.product.clone(),
            target_duration: project.target_duration,
            script,
            storyboard,
            options: job.generation_config.clone(),
        })
    }

    pub fn script_duration(&self) -> f64 {
        self.script.iter().map(|s| s.duration).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    Completed,
    Failed,
}

/// Provider output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResult {
    pub status: RenderStatus,
    pub artifact_urls: Vec<String>,
    #[serde(default)]
    pub extra: Value,
}

impl RenderResult {
    pub fn completed(artifact_urls: Vec<String>, extra: Value) -> Self {
        Self {
            status: RenderStatus::Completed,
            artifact_urls,
            extra,
        }
    }

    pub fn primary_url(&self) -> Option<&str> {
        self.artifact_urls.first().map(String::as_str)
    }
}

/// Sink for provider progress checkpoints.
#[async_trait]
pub trait RenderProgress: Send + Sync {
    async fn report(&self, progress: u8, message: &str);
}

/// Progress sink that drops every report.
pub struct NoProgress;

#[async_trait]
impl RenderProgress for NoProgress {
    async fn report(&self, _progress: u8, _message: &str) {}
}

/// Interchangeable rendering back-end.
#[async_trait]
pub trait RenderProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Render the request. Implementations check `cancel` between steps and
    /// return `ProviderError::Cancelled` once it fires.
    async fn render(
        &self,
        request: &RenderRequest,
        progress: &dyn RenderProgress,
        cancel: CancellationToken,
    ) -> ProviderResult<RenderResult>;
}
