//! Script stage: product context to a reconciled script and storyboard.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use cgen_models::{GenerationJob, ProjectStatus};

use super::Orchestrator;
use crate::error::StageError;

impl Orchestrator {
    pub(super) async fn run_script(
        &self,
        job: GenerationJob,
        shutdown: &CancellationToken,
    ) -> Result<(), StageError> {
        let project_id = job
            .project_id
            .clone()
            .ok_or_else(|| StageError::precondition("script job has no project"))?;
        let store = self.lifecycle.store();
        let project = store.get_project(&job.workspace_id, &project_id).await?;
        store
            .set_project_status(&job.workspace_id, &project_id, ProjectStatus::Processing)
            .await?;

        let progress = self.progress(&job);
        progress.step(10, "writing script").await;

        let writer = self.collaborators.script_writer.clone();
        let product = project.product.clone();
        let target = project.target_duration;
        let raw = self
            .guarded("script generation", shutdown, move |token| {
                let writer = writer.clone();
                let product = product.clone();
                async move {
                    writer
                        .write_script(&product, target, token)
                        .await
                        .map_err(StageError::from)
                }
            })
            .await?;

        progress.step(80, "reconciling durations").await;
        let bundle = raw.reconcile(target as f64)?;

        let results = json!({
            "segments": bundle.script.len(),
            "script_duration": bundle.script_duration(),
            "storyboard_duration": bundle.storyboard_duration(),
            "target_duration": target,
        });
        self.lifecycle
            .complete_script(&job.job_ref(), &project_id, &bundle, &results)
            .await?;
        Ok(())
    }
}
