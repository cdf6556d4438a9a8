//! Progress events via Redis Pub/Sub.
//!
//! One channel per task, `<namespace>:<task_id>`. Delivery is at-most-once
//! and non-durable: readers must take a snapshot from the job store first.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use cgen_models::{ProgressEvent, TaskId};

use crate::error::{QueueError, QueueResult};

/// Default publish bound; a slow bus must never stall a stage.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(500);

pub type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Publish/subscribe channel keyed by task id.
#[async_trait]
pub trait ProgressBus: Send + Sync {
    async fn publish(&self, event: &ProgressEvent) -> QueueResult<()>;

    /// Subscribe to events published after this call returns.
    async fn subscribe(&self, task_id: &TaskId) -> QueueResult<EventStream>;
}

/// Publish with a timeout, logging instead of failing.
pub async fn publish_best_effort(bus: &dyn ProgressBus, event: &ProgressEvent, timeout: Duration) {
    match tokio::time::timeout(timeout, bus.publish(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task_id = %event.task_id, "Failed to publish progress event: {}", e),
        Err(_) => warn!(
            task_id = %event.task_id,
            "{}",
            QueueError::PublishTimeout(timeout.as_millis() as u64)
        ),
    }
}

/// Redis Pub/Sub progress bus.
pub struct RedisProgressBus {
    client: redis::Client,
    namespace: String,
}

impl RedisProgressBus {
    pub fn new(redis_url: &str, namespace: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    /// Get the channel name for a task.
    pub fn channel_name(&self, task_id: &TaskId) -> String {
        format!("{}:{}", self.namespace, task_id)
    }
}

#[async_trait]
impl ProgressBus for RedisProgressBus {
    async fn publish(&self, event: &ProgressEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = self.channel_name(&event.task_id);
        let payload = serde_json::to_string(event)?;

        debug!("Publishing progress event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, task_id: &TaskId) -> QueueResult<EventStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel_name(task_id)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });
        Ok(Box::pin(stream))
    }
}

/// In-process bus over tokio broadcast channels.
pub struct InMemoryProgressBus {
    channels: Mutex<HashMap<TaskId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl Default for InMemoryProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl InMemoryProgressBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, broadcast::Sender<ProgressEvent>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live subscribers for a task.
    pub fn subscriber_count(&self, task_id: &TaskId) -> usize {
        self.channels()
            .get(task_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProgressBus for InMemoryProgressBus {
    async fn publish(&self, event: &ProgressEvent) -> QueueResult<()> {
        let mut channels = self.channels();
        if let Some(tx) = channels.get(&event.task_id) {
            // No receivers is not an error for a pub/sub bus
            let _ = tx.send(event.clone());
        }
        // Dropping the sender ends every subscriber stream after the
        // terminal event has been delivered.
        if event.is_terminal() {
            channels.remove(&event.task_id);
        } else {
            channels.retain(|_, tx| tx.receiver_count() > 0);
        }
        Ok(())
    }

    async fn subscribe(&self, task_id: &TaskId) -> QueueResult<EventStream> {
        let rx = self
            .channels()
            .entry(task_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgen_models::JobStatus;

    fn event(task: &str, status: JobStatus, progress: u8) -> ProgressEvent {
        ProgressEvent::new(TaskId::from(task), status, progress, "step")
    }

    #[tokio::test]
    async fn test_in_memory_ordered_delivery() {
        let bus = InMemoryProgressBus::default();
        let mut stream = bus.subscribe(&TaskId::from("t1")).await.unwrap();

        bus.publish(&event("t1", JobStatus::Processing, 10)).await.unwrap();
        bus.publish(&event("t2", JobStatus::Processing, 99)).await.unwrap();
        bus.publish(&event("t1", JobStatus::Processing, 30)).await.unwrap();
        bus.publish(&ProgressEvent::completed(TaskId::from("t1"), serde_json::json!({})))
            .await
            .unwrap();

        let received: Vec<u8> = (&mut stream).map(|e| e.progress).collect().await;
        assert_eq!(received, vec![10, 30, 100]);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = InMemoryProgressBus::default();
        bus.publish(&event("t1", JobStatus::Processing, 10)).await.unwrap();

        let mut stream = bus.subscribe(&TaskId::from("t1")).await.unwrap();
        bus.publish(&event("t1", JobStatus::Processing, 60)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().progress, 60);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = InMemoryProgressBus::default();
        let task = TaskId::from("t1");
        let stream = bus.subscribe(&task).await.unwrap();
        assert_eq!(bus.subscriber_count(&task), 1);
        drop(stream);

        bus.publish(&event("t1", JobStatus::Processing, 10)).await.unwrap();
        assert_eq!(bus.subscriber_count(&task), 0);
    }

    #[tokio::test]
    async fn test_publish_best_effort_never_fails() {
        let bus = InMemoryProgressBus::default();
        publish_best_effort(&bus, &event("t1", JobStatus::Processing, 5), Duration::from_millis(50))
            .await;
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_publish_subscribe() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let bus = RedisProgressBus::new(&url, "generation-test").unwrap();
        let task = TaskId::new();
        let mut stream = bus.subscribe(&task).await.unwrap();

        bus.publish(&ProgressEvent::new(task.clone(), JobStatus::Processing, 42, "x"))
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.progress, 42);
    }
}
