//! Application state.

use std::sync::Arc;

use cgen_jobs::JobLifecycle;
use cgen_queue::{QueueConfig, RedisProgressBus, RedisTaskQueue, TaskQueue};
use cgen_store::{Store, StoreConfig};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub lifecycle: Arc<JobLifecycle>,
}

impl AppState {
    pub fn new(config: ApiConfig, lifecycle: Arc<JobLifecycle>) -> Self {
        Self { config, lifecycle }
    }

    /// Connect the store, the Redis stage queue and the Redis progress bus.
    pub async fn from_env(config: ApiConfig) -> anyhow::Result<Self> {
        let store = Store::connect(&StoreConfig::from_env()).await?;

        let queue_config = QueueConfig::from_env();
        let bus = RedisProgressBus::new(&queue_config.redis_url, queue_config.progress_namespace.clone())?;
        let queue = RedisTaskQueue::new(queue_config)?;
        queue.init().await?;

        let lifecycle = JobLifecycle::new(store, Arc::new(queue), Arc::new(bus));
        Ok(Self::new(config, Arc::new(lifecycle)))
    }

    pub fn store(&self) -> &Store {
        self.lifecycle.store()
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        self.lifecycle.queue()
    }
}
