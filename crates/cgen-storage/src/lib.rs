//! Artifact storage for rendered videos and regenerated audio variants.
//!
//! - [`R2Client`]: Cloudflare R2 through the S3 API
//! - [`LocalStorage`]: a directory on disk, for development and tests

pub mod error;
pub mod local;
pub mod r2;
pub mod storage;

pub use error::{StorageError, StorageResult};
pub use local::LocalStorage;
pub use r2::{R2Client, R2Config};
pub use storage::{audio_track_key, audio_variant_key, ArtifactStorage};
