//! Rendering providers and generation collaborators.
//!
//! This crate provides:
//! - The `RenderProvider` capability with a deterministic mock and an
//!   HTTP-backed implementation parameterized by auth scheme and response shape
//! - `ProviderRegistry`, which resolves a configured name and falls back to mock
//! - Script, copy, image and speech collaborators with mock implementations

pub mod error;
pub mod generators;
pub mod http;
pub mod mock;
pub mod registry;
pub mod render;

pub use error::{ProviderError, ProviderResult};
pub use generators::{
    CopyRequest, CopyVariant, CopyWriter, GeneratedImage, ImageGenerator, ImageRequest,
    MockCopyWriter, MockImageGenerator, MockScriptWriter, MockSpeechSynthesizer, ScriptWriter,
    SpeechSynthesizer, SynthesizedSpeech,
};
pub use http::{AuthScheme, HttpProviderConfig, HttpRenderProvider, ResponseShape};
pub use mock::{MockRenderProvider, MOCK_CHECKPOINTS};
pub use registry::{ProviderConfig, ProviderRegistry};
pub use render::{
    NoProgress, RenderProgress, RenderProvider, RenderRequest, RenderResult, RenderStatus,
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cgen_models::{
        ProductContext, ProjectId, ScriptSegment, StoryboardScene, TaskId, WorkspaceId,
    };

    use crate::render::{RenderProgress, RenderRequest};

    #[derive(Default)]
    pub struct RecordingProgress {
        values: Mutex<Vec<u8>>,
    }

    impl RecordingProgress {
        pub fn values(&self) -> Vec<u8> {
            self.values.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RenderProgress for RecordingProgress {
        async fn report(&self, progress: u8, _message: &str) {
            self.values.lock().unwrap().push(progress);
        }
    }

    pub fn render_request() -> RenderRequest {
        RenderRequest {
            task_id: TaskId::new(),
            workspace_id: WorkspaceId::from("ws"),
            project_id: ProjectId::new(),
            product: ProductContext {
                name: "Aero".into(),
                description: String::new(),
                features: vec![],
                target_audience: None,
            },
            target_duration: 20,
            script: vec![
                ScriptSegment { text: "a".into(), duration: 10.0 },
                ScriptSegment { text: "b".into(), duration: 10.0 },
            ],
            storyboard: vec![
                StoryboardScene {
                    scene_index: 0,
                    duration: 10.0,
                    visual_prompt: "x".into(),
                    transition: "cut".into(),
                },
                StoryboardScene {
                    scene_index: 1,
                    duration: 10.0,
                    visual_prompt: "y".into(),
                    transition: "fade".into(),
                },
            ],
            options: serde_json::Value::Null,
        }
    }
}
