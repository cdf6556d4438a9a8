//! Audio track replacement on an existing rendered video.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;

/// Bitrate for the re-encoded narration track.
pub const DEFAULT_AUDIO_BITRATE: &str = "192k";

/// Replaces the audio of a video without touching its video stream.
#[async_trait]
pub trait AudioRemuxer: Send + Sync {
    /// Scale the loudness of `input` by `volume` into `output`.
    async fn adjust_loudness(
        &self,
        input: &Path,
        output: &Path,
        volume: f32,
        cancel: CancellationToken,
    ) -> MediaResult<()>;

    /// Mux the video stream of `video` with the audio of `audio` into `output`.
    async fn remux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        cancel: CancellationToken,
    ) -> MediaResult<()>;
}

/// FFmpeg CLI implementation of [`AudioRemuxer`].
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    timeout: Duration,
    audio_bitrate: String,
}

impl FfmpegRemuxer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            audio_bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
        }
    }

    pub fn with_audio_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.audio_bitrate = bitrate.into();
        self
    }

    fn runner(&self, cancel: CancellationToken) -> FfmpegRunner {
        FfmpegRunner::new()
            .with_cancel(cancel)
            .with_timeout(self.timeout)
    }

    pub fn loudness_command(input: &Path, output: &Path, volume: f32) -> FfmpegCommand {
        FfmpegCommand::new(output)
            .input(input)
            .audio_filter(format!("volume={:.2}", volume))
    }

    pub fn remux_command(&self, video: &Path, audio: &Path, output: &Path) -> FfmpegCommand {
        FfmpegCommand::new(output)
            .input(video)
            .input(audio)
            .map("0:v:0")
            .map("1:a:0")
            .video_codec("copy")
            .audio_codec("aac")
            .audio_bitrate(self.audio_bitrate.clone())
            .output_args(["-shortest", "-movflags", "+faststart"])
    }
}

impl Default for FfmpegRemuxer {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl AudioRemuxer for FfmpegRemuxer {
    async fn adjust_loudness(
        &self,
        input: &Path,
        output: &Path,
        volume: f32,
        cancel: CancellationToken,
    ) -> MediaResult<()> {
        info!(volume, "Adjusting narration loudness");
        let cmd = Self::loudness_command(input, output, volume);
        self.runner(cancel).run(&cmd).await
    }

    async fn remux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        cancel: CancellationToken,
    ) -> MediaResult<()> {
        info!(
            video = %video.display(),
            output = %output.display(),
            "Remuxing video with new audio track"
        );
        let cmd = self.remux_command(video, audio, output);
        self.runner(cancel).run(&cmd).await
    }
}
