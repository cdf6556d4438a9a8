//! Deterministic mock render provider.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::render::{RenderProgress, RenderProvider, RenderRequest, RenderResult};

/// Progress checkpoints reported by the mock provider, in order.
pub const MOCK_CHECKPOINTS: [(u8, &str); 5] = [
    (10, "preparing assets"),
    (30, "composing scenes"),
    (60, "rendering frames"),
    (90, "encoding video"),
    (100, "render complete"),
];

/// Simulates a multi-second render with fixed checkpoints.
#[derive(Debug, Clone)]
pub struct MockRenderProvider {
    step_delay: Duration,
    cdn_base: String,
}

impl Default for MockRenderProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl MockRenderProvider {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            cdn_base: "https://mock-cdn.local".to_string(),
        }
    }

    pub fn artifact_url(&self, request: &RenderRequest) -> String {
        format!("{}/videos/{}.mp4", self.cdn_base, request.task_id)
    }
}

#[async_trait]
impl RenderProvider for MockRenderProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn render(
        &self,
        request: &RenderRequest,
        progress: &dyn RenderProgress,
        cancel: CancellationToken,
    ) -> ProviderResult<RenderResult> {
        for (checkpoint, message) in MOCK_CHECKPOINTS {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(self.step_delay) => {}
            }
            debug!(task_id = %request.task_id, checkpoint, "Mock render checkpoint");
            progress.report(checkpoint, message).await;
        }

        Ok(RenderResult::completed(
            vec![self.artifact_url(request)],
            json!({
                "provider": "mock",
                "duration": request.script_duration(),
                "scenes": request.storyboard.len(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderStatus;
    use crate::test_support::{render_request, RecordingProgress};

    #[tokio::test]
    async fn test_mock_reports_all_checkpoints() {
        let provider = MockRenderProvider::new(Duration::from_millis(1));
        let progress = RecordingProgress::default();
        let request = render_request();

        let result = provider
            .render(&request, &progress, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RenderStatus::Completed);
        assert_eq!(result.artifact_urls.len(), 1);
        assert_eq!(
            result.primary_url().unwrap(),
            format!("https://mock-cdn.local/videos/{}.mp4", request.task_id)
        );
        assert_eq!(progress.values(), vec![10, 30, 60, 90, 100]);
    }

    #[tokio::test]
    async fn test_mock_honours_cancellation() {
        let provider = MockRenderProvider::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = provider
            .render(&render_request(), &RecordingProgress::default(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
