//! Generation job state machine.
//!
//! [`JobLifecycle`] is the only way pipeline code mutates job rows: each
//! operation is one guarded store transition followed by a best-effort
//! progress event. [`StaleJobSweeper`] fails jobs whose worker went silent.

pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod sweeper;

pub use error::{JobError, JobResult};
pub use lifecycle::{JobLifecycle, JobWatch, TIMEOUT_PREFIX};
pub use sweeper::{StaleJobSweeper, SweeperConfig, STALE_JOB_ERROR};
