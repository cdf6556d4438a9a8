//! Snapshot-then-subscribe job streams shared by the SSE and WebSocket
//! endpoints.
//!
//! A stream always opens with the persisted state of the job, forwards live
//! bus events after it, and ends with a synthetic `closed` frame once the job
//! is terminal. The bus is best effort, so the store is re-read on a slow
//! interval and a terminal state found there closes the stream too, even
//! after the subscription itself has dropped.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

use cgen_jobs::JobLifecycle;
use cgen_models::{JobRef, JobStatus, ProgressEvent, StreamFrame, TaskId};
use cgen_queue::EventStream;

use crate::error::ApiResult;

/// Default interval between store re-reads of a streamed job.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub type FrameStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

struct Live {
    lifecycle: Arc<JobLifecycle>,
    job_ref: JobRef,
    /// `None` once the subscription has ended; the store poll then carries
    /// the stream to its terminal state.
    events: Option<EventStream>,
    poll: Interval,
    last_progress: u8,
}

impl Live {
    /// Frame for a bus event, or `None` when the event is dropped. Progress
    /// that goes backwards is never forwarded.
    fn accept(&mut self, event: ProgressEvent) -> Option<StreamFrame> {
        if event.task_id != self.job_ref.task_id {
            return None;
        }
        if !event.is_terminal() {
            if event.progress < self.last_progress {
                return None;
            }
            self.last_progress = event.progress;
        }
        Some(StreamFrame::Progress(event))
    }
}

enum State {
    Live(Box<Live>),
    Closing { task_id: TaskId, status: JobStatus },
    Done,
}

async fn next_event(events: &mut Option<EventStream>) -> Option<ProgressEvent> {
    events.as_mut()?.next().await
}

fn after(frame: &StreamFrame, live: Box<Live>) -> State {
    match frame {
        StreamFrame::Progress(event) if event.is_terminal() => State::Closing {
            task_id: event.task_id.clone(),
            status: event.status,
        },
        _ => State::Live(live),
    }
}

/// Open a frame stream for one job.
///
/// The subscription is taken before the snapshot is read, so an unknown job
/// fails here (before any response is started) and no event published in
/// between is lost.
pub async fn open(
    lifecycle: Arc<JobLifecycle>,
    job_ref: JobRef,
    poll_interval: Duration,
) -> ApiResult<FrameStream> {
    let watch = lifecycle.watch(&job_ref).await?;
    let snapshot = ProgressEvent::snapshot(&watch.snapshot);

    let next = if snapshot.is_terminal() {
        // The bus channel of a finished job never delivers again
        State::Closing {
            task_id: snapshot.task_id.clone(),
            status: snapshot.status,
        }
    } else {
        let mut poll = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        State::Live(Box::new(Live {
            lifecycle,
            job_ref,
            events: Some(watch.events),
            poll,
            last_progress: snapshot.progress,
        }))
    };

    let first = stream::once(async move { StreamFrame::Snapshot(snapshot) });
    let rest = stream::unfold(next, |state| async move {
        match state {
            State::Done => None,
            State::Closing { task_id, status } => {
                Some((StreamFrame::Closed { task_id, status }, State::Done))
            }
            State::Live(mut live) => loop {
                tokio::select! {
                    event = next_event(&mut live.events), if live.events.is_some() => match event {
                        Some(event) => {
                            if let Some(frame) = live.accept(event) {
                                let next = after(&frame, live);
                                return Some((frame, next));
                            }
                        }
                        None => {
                            debug!(task_id = %live.job_ref.task_id, "Event subscription ended, following the store");
                            live.events = None;
                        }
                    },
                    _ = live.poll.tick() => {
                        match live.lifecycle.get(&live.job_ref).await {
                            Ok(job) if job.is_terminal() => {
                                debug!(task_id = %job.task_id, "Terminal state read from store, closing stream");
                                let frame = StreamFrame::Progress(ProgressEvent::snapshot(&job));
                                let next = after(&frame, live);
                                return Some((frame, next));
                            }
                            Ok(_) => {}
                            Err(e) => debug!(task_id = %live.job_ref.task_id, "Stream poll failed: {}", e),
                        }
                    }
                }
            },
        }
    });

    Ok(Box::pin(first.chain(rest)))
}
