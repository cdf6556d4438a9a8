//! WebSocket job progress stream.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use cgen_models::StreamFrame;

use crate::context::WorkspaceContext;
use crate::error::ApiResult;
use crate::handlers::jobs::StreamGuard;
use crate::handlers::job_ref;
use crate::metrics;
use crate::state::AppState;
use crate::stream::{self, FrameStream, DEFAULT_POLL_INTERVAL};

/// Interval between server pings on an idle socket.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// GET /ws/jobs/:task_type/:task_id
///
/// Same frames as the SSE endpoint, one JSON text message each, tagged with
/// `type`. The server closes the socket after the `closed` frame.
pub async fn ws_job_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path((task_type, task_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let job_ref = job_ref(&ctx, &task_type, &task_id)?;
    // Opened before the upgrade so an unknown job is a plain 404
    let frames = stream::open(state.lifecycle.clone(), job_ref, DEFAULT_POLL_INTERVAL).await?;
    Ok(ws.on_upgrade(move |socket| forward(socket, frames)))
}

fn encode(frame: &StreamFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!("Dropping unserializable stream frame: {}", e);
            None
        }
    }
}

async fn forward(socket: WebSocket, mut frames: FrameStream) {
    metrics::record_stream_opened("ws");
    let _guard = StreamGuard("ws");

    let (mut sender, mut receiver) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(frame) = frame else { break };
                let Some(message) = encode(&frame) else { continue };
                if sender.send(message).await.is_err() {
                    debug!("Client went away mid-stream");
                    return;
                }
                if frame.is_closed() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                // Client messages carry no meaning on this stream
                Some(Ok(_)) => {}
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
