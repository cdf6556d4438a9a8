//! Stage task queue and progress event bus.
//!
//! This crate provides:
//! - The `StageTask` envelope and its idempotency key
//! - `TaskQueue` over Redis Streams (consumer groups, claim, DLQ) or memory
//! - `ProgressBus` over Redis Pub/Sub or tokio broadcast channels

pub mod error;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod task;

pub use error::{QueueError, QueueResult};
pub use memory::InMemoryTaskQueue;
pub use progress::{
    publish_best_effort, EventStream, InMemoryProgressBus, ProgressBus, RedisProgressBus,
    DEFAULT_PUBLISH_TIMEOUT,
};
pub use queue::{QueueConfig, RedisTaskQueue, TaskQueue};
pub use task::{Delivery, Stage, StageTask};
