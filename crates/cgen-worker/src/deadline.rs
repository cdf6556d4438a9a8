//! Soft and hard deadlines around a stage invocation.
//!
//! The stage runs as a spawned task with a child cancellation token. At the
//! soft deadline the token is cancelled so the stage can release its
//! resources; if it is still running at the hard deadline the task is
//! aborted. Either way the invocation ends with [`StageError::Timeout`].

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StageError;

#[derive(Debug, Clone, Copy)]
pub struct DeadlineGuard {
    soft: Duration,
    hard: Duration,
}

fn joined<T>(result: Result<Result<T, StageError>, JoinError>) -> Result<T, StageError> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_panic() => Err(StageError::internal("stage panicked")),
        Err(_) => Err(StageError::internal("stage task was aborted")),
    }
}

impl DeadlineGuard {
    /// `hard` is raised to `soft` if smaller.
    pub fn new(soft: Duration, hard: Duration) -> Self {
        Self {
            soft,
            hard: hard.max(soft),
        }
    }

    pub fn soft(&self) -> Duration {
        self.soft
    }

    pub fn hard(&self) -> Duration {
        self.hard
    }

    /// Run `stage` under both deadlines. Cancelling `parent` (worker
    /// shutdown) cancels the stage token as well.
    pub async fn run<F, Fut, T>(&self, parent: &CancellationToken, stage: F) -> Result<T, StageError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, StageError>> + Send + 'static,
        T: Send + 'static,
    {
        let token = parent.child_token();
        let mut handle = tokio::spawn(stage(token.clone()));

        tokio::select! {
            result = &mut handle => return joined(result),
            _ = tokio::time::sleep(self.soft) => {}
        }

        let soft_secs = self.soft.as_secs();
        warn!("Stage exceeded soft deadline of {}s, cancelling", soft_secs);
        token.cancel();

        let grace = self.hard.saturating_sub(self.soft);
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("Stage ignored cancellation until the hard deadline, aborting");
            handle.abort();
            // Wait for the abort so resources owned by the task are dropped
            let _ = handle.await;
        }
        Err(StageError::Timeout(soft_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fast_stage_returns_its_result() {
        let guard = DeadlineGuard::new(Duration::from_secs(5), Duration::from_secs(10));
        let result = guard
            .run(&CancellationToken::new(), |_| async { Ok::<_, StageError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_soft_deadline_cancels_cooperatively() {
        let guard = DeadlineGuard::new(Duration::from_millis(20), Duration::from_secs(5));
        let cleaned_up = Arc::new(AtomicBool::new(false));
        let flag = cleaned_up.clone();

        let result: Result<(), _> = guard
            .run(&CancellationToken::new(), move |cancel| async move {
                cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Err::<(), _>(StageError::internal("cancelled"))
            })
            .await;

        assert!(matches!(result, Err(StageError::Timeout(_))));
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_hard_deadline_aborts_uncooperative_stage() {
        let guard = DeadlineGuard::new(Duration::from_millis(10), Duration::from_millis(30));
        let started = std::time::Instant::now();

        let result: Result<(), _> = guard
            .run(&CancellationToken::new(), |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<(), StageError>(())
            })
            .await;

        assert!(matches!(result, Err(StageError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_panicking_stage_becomes_internal_error() {
        let guard = DeadlineGuard::new(Duration::from_secs(5), Duration::from_secs(5));
        let result: Result<(), _> = guard
            .run(&CancellationToken::new(), |_| async {
                if true {
                    panic!("boom");
                }
                Ok::<(), StageError>(())
            })
            .await;
        assert!(matches!(result, Err(StageError::Internal(_))));
    }
}
