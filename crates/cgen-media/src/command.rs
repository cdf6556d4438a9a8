//! FFmpeg command builder and runner.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// Stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 8;

/// Builder for FFmpeg commands with one or more inputs.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    /// Arguments before the first -i
    input_args: Vec<String>,
    /// Arguments after the last -i
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Add an input file. Inputs are numbered in the order added.
    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.inputs.push(path.as_ref().to_path_buf());
        self
    }

    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Select a stream, e.g. `0:v:0`.
    pub fn map(self, spec: impl Into<String>) -> Self {
        self.output_arg("-map").output_arg(spec)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    pub fn audio_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-filter:a").output_arg(filter)
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    pub fn input_paths(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }
        args.push("-v".to_string());
        args.push(self.log_level.clone());
        args.push("-nostdin".to_string());

        args.extend(self.input_args.iter().cloned());
        for input in &self.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().to_string());
        }

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Runs FFmpeg with a timeout and cooperative cancellation. The child is
/// killed on every early exit, including when the runner future is dropped.
#[derive(Debug, Clone, Default)]
pub struct FfmpegRunner {
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        for input in cmd.input_paths() {
            if !input.exists() {
                return Err(MediaError::FileNotFound(input.clone()));
            }
        }
        let ffmpeg = check_ffmpeg()?;

        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::ffmpeg_failed("stderr not captured", None, None))?;
        let tail_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        let cancel = self.cancel.clone().unwrap_or_default();
        let deadline = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                info!("FFmpeg cancelled, killing process");
                let _ = child.kill().await;
                return Err(MediaError::Cancelled);
            }
            _ = deadline => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!("FFmpeg timed out after {} seconds, killing process", secs);
                let _ = child.kill().await;
                return Err(MediaError::Timeout(secs));
            }
        };

        let tail = tail_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(MediaError::ffmpeg_failed(
                "FFmpeg exited with non-zero status",
                Some(tail),
                status.code(),
            ))
        }
    }
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_input_builder() {
        let cmd = FfmpegCommand::new("out.mp4")
            .input("video.mp4")
            .input("voice.wav")
            .map("0:v:0")
            .map("1:a:0")
            .video_codec("copy");

        let args = cmd.build_args();
        let inputs: Vec<_> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-i")
            .map(|(i, _)| args[i + 1].as_str())
            .collect();
        assert_eq!(inputs, vec!["video.mp4", "voice.wav"]);
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
        assert_eq!(args[0], "-y");
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_spawn() {
        let cmd = FfmpegCommand::new("out.mp4").input("/definitely/not/here.mp4");
        let err = FfmpegRunner::new().run(&cmd).await.unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }

    #[test]
    fn test_describe_includes_stderr() {
        let err = MediaError::ffmpeg_failed(
            "FFmpeg exited with non-zero status",
            Some("Invalid data found when processing input\n".into()),
            Some(1),
        );
        assert_eq!(
            err.describe(),
            "FFmpeg exited with non-zero status: Invalid data found when processing input"
        );
    }
}
