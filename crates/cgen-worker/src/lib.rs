//! Generation pipeline worker.
//!
//! This crate provides:
//! - The stage orchestrator (script, render, audio regeneration, copy, image)
//! - Soft/hard deadlines and the retry policy around every stage
//! - The queue executor with concurrency limit, stale claim and DLQ handling
//! - Graceful shutdown

pub mod config;
pub mod deadline;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod retry;

pub use config::WorkerConfig;
pub use deadline::DeadlineGuard;
pub use error::{StageError, WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use orchestrator::{Collaborators, Orchestrator, StageOutcome};
pub use retry::{FailureTracker, RetryPolicy};
