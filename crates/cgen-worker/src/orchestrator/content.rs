//! Single-shot content stages: marketing copy and images.

use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cgen_models::GenerationJob;
use cgen_providers::{CopyRequest, ImageRequest};

use super::Orchestrator;
use crate::error::StageError;

fn parse_params<T: DeserializeOwned>(job: &GenerationJob) -> Result<T, StageError> {
    serde_json::from_value(job.generation_config.clone())
        .map_err(|e| StageError::InvalidParams(e.to_string()))
}

impl Orchestrator {
    pub(super) async fn run_copy(
        &self,
        job: GenerationJob,
        shutdown: &CancellationToken,
    ) -> Result<(), StageError> {
        let request: CopyRequest = parse_params(&job)?;
        let progress = self.progress(&job);
        progress.step(20, "writing copy").await;

        let writer = self.collaborators.copy_writer.clone();
        let variants = self
            .guarded("copy generation", shutdown, move |token| {
                let writer = writer.clone();
                let request = request.clone();
                async move {
                    writer
                        .write_copy(&request, token)
                        .await
                        .map_err(StageError::from)
                }
            })
            .await?;

        self.lifecycle
            .complete(&job.job_ref(), &json!({ "variants": variants }))
            .await?;
        Ok(())
    }

    pub(super) async fn run_image(
        &self,
        job: GenerationJob,
        shutdown: &CancellationToken,
    ) -> Result<(), StageError> {
        let request: ImageRequest = parse_params(&job)?;
        let progress = self.progress(&job);
        progress.step(20, "generating images").await;

        let generator = self.collaborators.image_generator.clone();
        let images = self
            .guarded("image generation", shutdown, move |token| {
                let generator = generator.clone();
                let request = request.clone();
                async move {
                    generator
                        .generate(&request, token)
                        .await
                        .map_err(StageError::from)
                }
            })
            .await?;

        self.lifecycle
            .complete(&job.job_ref(), &json!({ "images": images }))
            .await?;
        Ok(())
    }
}
