//! Stage task queue using Redis Streams.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::task::{Delivery, StageTask};

/// Seconds a dedup key outlives its enqueue.
const DEDUP_TTL_SECS: u64 = 3600;

/// Seconds a delivery counter is kept.
const DELIVERY_COUNTER_TTL_SECS: i64 = 86400;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for stage tasks
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Prefix for auxiliary keys (dedup, delivery counters)
    pub key_prefix: String,
    /// Deliveries before a task is dead-lettered
    pub max_deliveries: u32,
    /// Idle time before another consumer may claim a delivery
    pub visibility_timeout: Duration,
    /// Pub/Sub namespace for progress channels
    pub progress_namespace: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "cgen:tasks".to_string(),
            consumer_group: "cgen:workers".to_string(),
            dlq_stream_name: "cgen:dlq".to_string(),
            key_prefix: "cgen".to_string(),
            max_deliveries: 3,
            visibility_timeout: Duration::from_secs(600),
            progress_namespace: "generation".to_string(),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            max_deliveries: std::env::var("QUEUE_MAX_DELIVERIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_deliveries),
            visibility_timeout: std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            progress_namespace: std::env::var("PROGRESS_NAMESPACE")
                .unwrap_or(defaults.progress_namespace),
        }
    }
}

/// Durable, at-least-once stage task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task. Rejects a task whose idempotency key is still live.
    async fn enqueue(&self, task: &StageTask) -> QueueResult<String>;

    /// Take up to `count` new deliveries, waiting at most `block`.
    async fn consume(
        &self,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Mark a delivery done and release its idempotency key.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Move a delivery to the dead letter queue.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()>;

    /// Count one more failed delivery and return the new total.
    async fn increment_deliveries(&self, delivery: &Delivery) -> QueueResult<u32>;

    /// Take over deliveries idle for at least `min_idle` (crashed consumers).
    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    async fn len(&self) -> QueueResult<u64>;

    async fn dlq_len(&self) -> QueueResult<u64>;

    /// Connectivity check for readiness probes.
    async fn ping(&self) -> QueueResult<()>;
}

/// Redis Streams task queue.
pub struct RedisTaskQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl RedisTaskQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create the consumer group if it does not exist.
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    fn dedup_key(&self, task: &StageTask) -> String {
        format!("{}:dedup:{}", self.config.key_prefix, task.idempotency_key())
    }

    fn deliveries_key(&self, message_id: &str) -> String {
        format!("{}:deliveries:{}", self.config.key_prefix, message_id)
    }

    /// Decode stream entries, acking anything that cannot be parsed so it is
    /// not redelivered forever.
    async fn decode_entries(&self, entries: Vec<redis::streams::StreamId>) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for entry in entries {
            let message_id = entry.id.clone();
            let parsed = match entry.map.get("task") {
                Some(redis::Value::BulkString(payload)) => {
                    serde_json::from_slice::<StageTask>(payload).map_err(|e| e.to_string())
                }
                _ => Err("missing task field".to_string()),
            };
            match parsed {
                Ok(task) => deliveries.push(Delivery { message_id, task }),
                Err(e) => {
                    warn!(message_id = %message_id, "Dropping malformed task payload: {}", e);
                    if let Err(e) = self.xack_del(&message_id).await {
                        warn!(message_id = %message_id, "Failed to ack malformed task: {}", e);
                    }
                }
            }
        }
        deliveries
    }

    async fn xack_del(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;
        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn release_keys(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(&[
            self.dedup_key(&delivery.task),
            self.deliveries_key(&delivery.message_id),
        ])
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &StageTask) -> QueueResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let payload = serde_json::to_string(task)?;
        let dedup_key = self.dedup_key(task);

        // SET NX claims the key atomically so two racing enqueues cannot both pass
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&dedup_key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            warn!("Duplicate task rejected: {}", task.idempotency_key());
            return Err(QueueError::Duplicate(task.idempotency_key()));
        }

        let added: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("task")
            .arg(&payload)
            .arg("key")
            .arg(task.idempotency_key())
            .query_async(&mut conn)
            .await;
        let message_id = match added {
            Ok(id) => id,
            Err(e) => {
                conn.del::<_, ()>(&dedup_key).await.ok();
                return Err(e.into());
            }
        };

        info!(
            task_id = %task.task_id(),
            stage = %task.stage,
            "Enqueued task with message ID {}",
            message_id
        );
        Ok(message_id)
    }

    async fn consume(
        &self,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Option<redis::streams::StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entries = result
            .map(|reply| reply.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        Ok(self.decode_entries(entries).await)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.xack_del(&delivery.message_id).await?;
        self.release_keys(delivery).await?;
        debug!(message_id = %delivery.message_id, "Acknowledged task");
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(&delivery.task)?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("task")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(delivery).await?;

        warn!(
            task_id = %delivery.task.task_id(),
            "Moved task to DLQ: {}",
            error
        );
        Ok(())
    }

    async fn increment_deliveries(&self, delivery: &Delivery) -> QueueResult<u32> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.deliveries_key(&delivery.message_id);
        let count: u32 = conn.incr(&key, 1).await?;
        conn.expire::<_, ()>(&key, DELIVERY_COUNTER_TTL_SECS).await?;
        Ok(count)
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let claimed: redis::streams::StreamClaimReply = cmd.query_async(&mut conn).await?;

        let deliveries = self.decode_entries(claimed.ids).await;
        for delivery in &deliveries {
            info!(
                task_id = %delivery.task.task_id(),
                message_id = %delivery.message_id,
                "Claimed idle task"
            );
        }
        Ok(deliveries)
    }

    async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(&self.config.dlq_stream_name).await?;
        Ok(len)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Stage;
    use cgen_models::{JobRef, JobTable, TaskId, WorkspaceId};

    fn unique_config() -> QueueConfig {
        let suffix = TaskId::new();
        QueueConfig {
            stream_name: format!("cgen:test:tasks:{}", suffix),
            consumer_group: format!("cgen:test:group:{}", suffix),
            dlq_stream_name: format!("cgen:test:dlq:{}", suffix),
            key_prefix: format!("cgen:test:{}", suffix),
            ..QueueConfig::from_env()
        }
    }

    fn task() -> StageTask {
        StageTask::new(
            Stage::Copy,
            JobRef::new(JobTable::Copy, WorkspaceId::from("ws"), TaskId::new()),
            0,
            serde_json::json!({}),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_deliveries, 3);
        assert_eq!(config.progress_namespace, "generation");
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_round_trip() {
        let queue = RedisTaskQueue::new(unique_config()).unwrap();
        queue.init().await.unwrap();

        let task = task();
        queue.enqueue(&task).await.unwrap();
        assert!(queue.enqueue(&task).await.unwrap_err().is_duplicate());

        let deliveries = queue
            .consume("c1", Duration::from_millis(100), 10)
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].task, task);

        queue.ack(&deliveries[0]).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
        // Dedup key released on ack
        queue.enqueue(&task).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_claim_and_dead_letter() {
        let queue = RedisTaskQueue::new(unique_config()).unwrap();
        queue.init().await.unwrap();
        queue.enqueue(&task()).await.unwrap();

        let first = queue
            .consume("crashed", Duration::from_millis(100), 1)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let claimed = queue
            .claim_stale("healthy", Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(queue.increment_deliveries(&claimed[0]).await.unwrap(), 1);

        queue.dead_letter(&claimed[0], "boom").await.unwrap();
        assert_eq!(queue.dlq_len().await.unwrap(), 1);
    }
}
