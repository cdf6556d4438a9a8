//! Job record store for the generation pipeline.
//!
//! SQLite via sqlx. Provides:
//! - One table per job variant (copy, image, video) with guarded transitions
//! - The video project aggregate, rendered videos and audio track history
//! - Multi-row commits (script, render, audio regeneration) in one transaction
//!
//! Every read and write is scoped by workspace, except the staleness scan.

pub mod error;
pub mod jobs;
pub mod pool;
pub mod projects;
mod rows;
pub mod videos;

pub use error::{StoreError, StoreResult};
pub use jobs::MAX_PROCESSING_PROGRESS;
pub use pool::{Store, StoreConfig};
