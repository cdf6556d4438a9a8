//! In-process task queue for tests and single-binary development.
//!
//! Mirrors the Redis semantics the executor relies on: unacked deliveries
//! stay pending and can be claimed after `min_idle`, idempotency keys live
//! until ack or dead-lettering.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::queue::TaskQueue;
use crate::task::{Delivery, StageTask};

#[derive(Default)]
struct State {
    ready: VecDeque<Delivery>,
    pending: HashMap<String, (Delivery, Instant)>,
    dlq: Vec<(StageTask, String)>,
    deliveries: HashMap<String, u32>,
    keys: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
    notify: Notify,
    seq: AtomicU64,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a panicking test thread; the data is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tasks currently waiting for a consumer.
    pub fn ready_tasks(&self) -> Vec<StageTask> {
        self.lock().ready.iter().map(|d| d.task.clone()).collect()
    }

    /// Dead-lettered tasks with their errors.
    pub fn dead_lettered(&self) -> Vec<(StageTask, String)> {
        self.lock().dlq.clone()
    }

    /// Deliveries handed out but not yet acked.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn take_ready(&self, count: usize) -> Vec<Delivery> {
        let mut state = self.lock();
        let n = count.min(state.ready.len());
        let taken: Vec<Delivery> = state.ready.drain(..n).collect();
        let now = Instant::now();
        for delivery in &taken {
            state
                .pending
                .insert(delivery.message_id.clone(), (delivery.clone(), now));
        }
        taken
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: &StageTask) -> QueueResult<String> {
        let key = task.idempotency_key();
        let message_id = format!("{}-0", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        {
            let mut state = self.lock();
            if !state.keys.insert(key.clone()) {
                return Err(QueueError::Duplicate(key));
            }
            state.ready.push_back(Delivery {
                message_id: message_id.clone(),
                task: task.clone(),
            });
        }
        self.notify.notify_one();
        debug!(task_id = %task.task_id(), "Enqueued task {}", message_id);
        Ok(message_id)
    }

    async fn consume(
        &self,
        _consumer: &str,
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let taken = self.take_ready(count);
            if !taken.is_empty() {
                return Ok(taken);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.lock();
        state.pending.remove(&delivery.message_id);
        state.deliveries.remove(&delivery.message_id);
        state.keys.remove(&delivery.task.idempotency_key());
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        self.ack(delivery).await?;
        self.lock()
            .dlq
            .push((delivery.task.clone(), error.to_string()));
        Ok(())
    }

    async fn increment_deliveries(&self, delivery: &Delivery) -> QueueResult<u32> {
        let mut state = self.lock();
        let count = state
            .deliveries
            .entry(delivery.message_id.clone())
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn claim_stale(
        &self,
        _consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut state = self.lock();
        let now = Instant::now();
        let mut claimed = Vec::new();
        for (delivery, since) in state.pending.values_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(*since) >= min_idle {
                *since = now;
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn len(&self) -> QueueResult<u64> {
        let state = self.lock();
        Ok((state.ready.len() + state.pending.len()) as u64)
    }

    async fn dlq_len(&self) -> QueueResult<u64> {
        Ok(self.lock().dlq.len() as u64)
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
