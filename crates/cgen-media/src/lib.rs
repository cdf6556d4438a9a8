//! FFmpeg wrapper used by the audio regeneration stage.
//!
//! Only the CLI is used; no libav bindings. Every spawned process is
//! killed on cancellation, timeout or drop.

pub mod command;
pub mod error;
pub mod remux;

pub use command::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use remux::{AudioRemuxer, FfmpegRemuxer, DEFAULT_AUDIO_BITRATE};
