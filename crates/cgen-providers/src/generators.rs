//! Opaque generation collaborators (LLM, image model, TTS) and their
//! deterministic mocks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use cgen_models::{AudioSettings, ProductContext, ScriptBundle, ScriptSegment, StoryboardScene};

use crate::error::{ProviderError, ProviderResult};

/// Produces a script and storyboard for a product.
///
/// Output is raw: the caller reconciles durations with the target.
#[async_trait]
pub trait ScriptWriter: Send + Sync {
    async fn write_script(
        &self,
        product: &ProductContext,
        target_duration: u32,
        cancel: CancellationToken,
    ) -> ProviderResult<ScriptBundle>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRequest {
    pub product_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_variants")]
    pub variants: u32,
}

fn default_tone() -> String {
    "friendly".to_string()
}

fn default_channel() -> String {
    "social".to_string()
}

fn default_variants() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyVariant {
    pub headline: String,
    pub body: String,
}

#[async_trait]
pub trait CopyWriter: Send + Sync {
    async fn write_copy(
        &self,
        request: &CopyRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<Vec<CopyVariant>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_dimension() -> u32 {
    1024
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &ImageRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<Vec<GeneratedImage>>;
}

#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    pub path: PathBuf,
    pub duration_secs: f64,
}

/// Text-to-speech into a local audio file.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        settings: &AudioSettings,
        output: &Path,
        cancel: CancellationToken,
    ) -> ProviderResult<SynthesizedSpeech>;
}

fn ensure_live(cancel: &CancellationToken) -> ProviderResult<()> {
    if cancel.is_cancelled() {
        Err(ProviderError::Cancelled)
    } else {
        Ok(())
    }
}

/// Builds a hook, one segment per feature (up to three) and a call to
/// action. Raw durations deliberately miss the target.
#[derive(Debug, Clone, Default)]
pub struct MockScriptWriter;

#[async_trait]
impl ScriptWriter for MockScriptWriter {
    async fn write_script(
        &self,
        product: &ProductContext,
        target_duration: u32,
        cancel: CancellationToken,
    ) -> ProviderResult<ScriptBundle> {
        ensure_live(&cancel)?;

        let mut lines = vec![format!("Meet {}.", product.name)];
        if product.features.is_empty() {
            lines.push(if product.description.is_empty() {
                format!("{} makes every day easier.", product.name)
            } else {
                product.description.clone()
            });
        }
        lines.extend(
            product
                .features
                .iter()
                .take(3)
                .map(|f| format!("It's {}.", f.trim_end_matches('.'))),
        );
        lines.push(format!("Get {} today.", product.name));

        let per_segment = target_duration as f64 * 0.9 / lines.len() as f64;
        let mut script = Vec::with_capacity(lines.len());
        let mut storyboard = Vec::with_capacity(lines.len());
        for (i, text) in lines.into_iter().enumerate() {
            // Vary the raw durations so reconciliation has work to do
            let duration = per_segment * if i % 2 == 0 { 0.8 } else { 1.2 };
            storyboard.push(StoryboardScene {
                scene_index: i as u32,
                duration: duration + 0.5,
                visual_prompt: format!("{} product shot, scene {}", product.name, i + 1),
                transition: if i == 0 { "cut".into() } else { "fade".into() },
            });
            script.push(ScriptSegment { text, duration });
        }

        Ok(ScriptBundle { script, storyboard })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockCopyWriter;

#[async_trait]
impl CopyWriter for MockCopyWriter {
    async fn write_copy(
        &self,
        request: &CopyRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<Vec<CopyVariant>> {
        ensure_live(&cancel)?;
        if request.product_name.trim().is_empty() {
            return Err(ProviderError::generation_failed("product name is empty"));
        }
        Ok((1..=request.variants.max(1))
            .map(|n| CopyVariant {
                headline: format!("{} #{}: made for {}", request.product_name, n, request.channel),
                body: format!(
                    "A {} take on {}. {}",
                    request.tone, request.product_name, request.description
                )
                .trim_end()
                .to_string(),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct MockImageGenerator {
    cdn_base: String,
}

impl Default for MockImageGenerator {
    fn default() -> Self {
        Self {
            cdn_base: "https://mock-cdn.local".to_string(),
        }
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate(
        &self,
        request: &ImageRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<Vec<GeneratedImage>> {
        ensure_live(&cancel)?;
        let slug: String = request
            .prompt
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
            .take(32)
            .collect::<String>()
            .trim()
            .replace(' ', "-")
            .to_ascii_lowercase();
        Ok((0..request.count.max(1))
            .map(|i| GeneratedImage {
                url: format!("{}/images/{}-{}.png", self.cdn_base, slug, i),
                width: request.width,
                height: request.height,
            })
            .collect())
    }
}

/// Writes a silent 16 kHz mono WAV whose length follows the word count.
#[derive(Debug, Clone, Default)]
pub struct MockSpeechSynthesizer;

const MOCK_SAMPLE_RATE: u32 = 16_000;

/// Speech rate used to size the mock audio, words per second.
const MOCK_WORDS_PER_SEC: f64 = 2.5;

fn silent_wav(duration_secs: f64) -> Vec<u8> {
    let samples = (duration_secs * MOCK_SAMPLE_RATE as f64).round() as u32;
    let data_len = samples * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&MOCK_SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&(MOCK_SAMPLE_RATE * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    out
}

#[async_trait]
impl SpeechSynthesizer for MockSpeechSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        settings: &AudioSettings,
        output: &Path,
        cancel: CancellationToken,
    ) -> ProviderResult<SynthesizedSpeech> {
        ensure_live(&cancel)?;
        let words = text.split_whitespace().count();
        if words == 0 {
            return Err(ProviderError::generation_failed("no text to synthesize"));
        }
        let speed = if settings.speed > 0.0 { settings.speed } else { 1.0 };
        let duration_secs = (words as f64 / MOCK_WORDS_PER_SEC / speed).max(0.5);

        tokio::fs::write(output, silent_wav(duration_secs)).await?;
        Ok(SynthesizedSpeech {
            path: output.to_path_buf(),
            duration_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(features: &[&str]) -> ProductContext {
        ProductContext {
            name: "Aero".into(),
            description: "A travel bottle".into(),
            features: features.iter().map(|s| s.to_string()).collect(),
            target_audience: None,
        }
    }

    #[tokio::test]
    async fn test_mock_script_reconciles_to_target() {
        let raw = MockScriptWriter
            .write_script(&product(&["leak proof", "light"]), 30, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(raw.script.len(), 4);
        assert!(!raw.is_aligned(30.0));

        let bundle = raw.reconcile(30.0).unwrap();
        assert!(bundle.is_aligned(30.0));
        assert!(bundle.script.len() >= 2 && bundle.storyboard.len() >= 2);
    }

    #[tokio::test]
    async fn test_mock_script_without_features_has_two_segments_minimum() {
        let raw = MockScriptWriter
            .write_script(&product(&[]), 15, CancellationToken::new())
            .await
            .unwrap();
        assert!(raw.script.len() >= 2);
    }

    #[tokio::test]
    async fn test_mock_copy_variants() {
        let request: CopyRequest =
            serde_json::from_value(serde_json::json!({"product_name": "Aero"})).unwrap();
        let variants = MockCopyWriter
            .write_copy(&request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(variants.len(), 3);
    }

    #[tokio::test]
    async fn test_mock_images() {
        let request = ImageRequest {
            prompt: "Blue bottle, on a beach!".into(),
            width: 512,
            height: 512,
            count: 2,
        };
        let images = MockImageGenerator::default()
            .generate(&request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].url.ends_with("blue-bottle-on-a-beach-0.png"));
    }

    #[tokio::test]
    async fn test_mock_speech_writes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("voice.wav");
        let speech = MockSpeechSynthesizer
            .synthesize(
                "one two three four five",
                &AudioSettings::default(),
                &out,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!((speech.duration_secs - 2.0).abs() < 1e-9);
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(bytes.len(), 44 + 2 * 32_000);
    }

    #[tokio::test]
    async fn test_cancelled_generation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = MockScriptWriter
            .write_script(&product(&[]), 30, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
