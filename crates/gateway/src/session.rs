//! Client session: owns the read pump and write pump tasks for one
//! WebSocket connection, the heartbeat state machine, and backpressure
//! handling on the outbound queue.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU32, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wsgate_protocol::{ApplicationMessage, CloseReason, ErrorMessage, error_codes};

use crate::{
    rate_limit::MessageBucket,
    registry::{ConnectionHandle, OutboundItem},
};

#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Heartbeat state machine. Idle while no ping is outstanding; transitions
/// to AwaitingPong when a ping is sent, back to Idle on pong, and to
/// Closing if a pong doesn't arrive within `pong_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    AwaitingPong,
    Closing,
}

/// What the router/caller does with a message accepted from a session.
pub enum Inbound {
    Message(ApplicationMessage),
    RateLimited,
    TooLarge { actual: usize, max: usize },
    Malformed(String),
}

/// Runtime configuration a session needs, pulled out of `ServerConfig` so
/// the session doesn't hold a reference to the whole `GatewayConfig`.
#[derive(Clone)]
pub struct SessionLimits {
    pub max_message_size: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub outbound_queue_capacity: usize,
    pub slow_drop_threshold: u32,
    pub slow_drop_window: Duration,
}

/// Counts backpressure drops in a sliding window; once `threshold` drops
/// land within `window`, the session is proactively closed.
pub struct SlowDropTracker {
    threshold: u32,
    window: Duration,
    count: AtomicU32,
    window_started_ms: AtomicI64,
}

impl SlowDropTracker {
    #[must_use]
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            count: AtomicU32::new(0),
            window_started_ms: AtomicI64::new(now_ms()),
        }
    }

    /// Record a drop; returns true if the session should now be closed.
    pub fn record_drop(&self) -> bool {
        let now = now_ms();
        let started = self.window_started_ms.load(Ordering::Relaxed);
        if now - started > self.window.as_millis() as i64 {
            self.window_started_ms.store(now, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            return false;
        }
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        count >= self.threshold
    }
}

/// Enqueue a frame onto a connection's outbound channel without blocking.
/// On failure (queue full), records the drop and proactively closes the
/// session once the slow-drop threshold is crossed within the window.
pub fn enqueue_or_drop(
    handle: &ConnectionHandle,
    tracker: &SlowDropTracker,
    frame: String,
) -> bool {
    if handle.try_send_frame(frame) {
        return true;
    }
    metrics::counter!(
        wsgate_metrics::errors::ERRORS_TOTAL,
        wsgate_metrics::labels::ERROR_TYPE => "client_slow"
    )
    .increment(1);
    metrics::counter!(wsgate_metrics::websocket::SLOW_DROPS_TOTAL).increment(1);
    if tracker.record_drop() {
        handle.try_close(CloseReason::ClientSlowAbuse);
    }
    false
}

/// Drive the write side of a session: drains the outbound queue onto the
/// socket, coalescing consecutive frames with newlines, and runs the
/// heartbeat state machine (Idle -> AwaitingPong -> Idle, or -> Closing if
/// no pong lands within `pong_wait`). `handle.last_activity_ms` is touched
/// by the read pump on every pong, which is how this loop detects a
/// satisfied ping without the two pumps sharing a channel.
pub async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundItem>,
    handle: Arc<ConnectionHandle>,
    limits: SessionLimits,
    conn_id: String,
) {
    let mut ping_interval = tokio::time::interval(limits.ping_period);
    ping_interval.tick().await;
    let mut state = HeartbeatState::Idle;
    let mut ping_sent_at_ms = 0_i64;

    loop {
        tokio::select! {
            item = outbound_rx.recv() => {
                match item {
                    Some(OutboundItem::Frame(frame)) => {
                        // Coalesce any further already-queued frames with newlines.
                        let mut batch = frame;
                        while let Ok(OutboundItem::Frame(next)) = outbound_rx.try_recv() {
                            batch.push('\n');
                            batch.push_str(&next);
                        }
                        if tokio::time::timeout(limits.write_wait, sink.send(Message::Text(batch.into())))
                            .await
                            .is_err()
                        {
                            debug!(conn_id = %conn_id, "write pump: write timed out");
                            break;
                        }
                    }
                    Some(OutboundItem::Close(reason)) => {
                        let _ = sink
                            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                code: 1000,
                                reason: reason.as_str().into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if state == HeartbeatState::AwaitingPong && handle.last_activity_ms() < ping_sent_at_ms {
                    state = HeartbeatState::Closing;
                    metrics::counter!(wsgate_metrics::websocket::HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                    warn!(conn_id = %conn_id, "write pump: heartbeat timeout, no pong received");
                    let _ = sink
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code: 1000,
                            reason: CloseReason::HeartbeatTimeout.as_str().into(),
                        })))
                        .await;
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    debug!(conn_id = %conn_id, "write pump: ping failed");
                    break;
                }
                ping_sent_at_ms = now_ms();
                state = HeartbeatState::AwaitingPong;
            }
        }
    }
    debug!(conn_id = %conn_id, "write pump: exiting");
}

/// Drive the read side of a session: parses inbound text frames as
/// newline-delimited `ApplicationMessage`s, enforces the per-client
/// message rate limit, and touches `last_activity` on every frame
/// (including pongs).
pub struct ReadPumpOutcome {
    pub close_reason: CloseReason,
}

pub async fn read_pump<F, Fut>(
    mut stream: futures::stream::SplitStream<WebSocket>,
    handle: Arc<ConnectionHandle>,
    message_bucket: Arc<MessageBucket>,
    max_message_size: usize,
    mut on_message: F,
) -> ReadPumpOutcome
where
    F: FnMut(Inbound) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(client_id = handle.client_id, error = %e, "read pump: transport error");
                return ReadPumpOutcome {
                    close_reason: CloseReason::TransportError,
                };
            },
        };

        match msg {
            Message::Text(text) => {
                handle.touch(now_ms());
                for line in text.split('\n').filter(|l| !l.is_empty()) {
                    if line.len() > max_message_size {
                        on_message(Inbound::TooLarge {
                            actual: line.len(),
                            max: max_message_size,
                        })
                        .await;
                        continue;
                    }
                    if !message_bucket.try_consume().await {
                        on_message(Inbound::RateLimited).await;
                        continue;
                    }
                    match serde_json::from_str::<ApplicationMessage>(line) {
                        Ok(parsed) => on_message(Inbound::Message(parsed)).await,
                        Err(e) => on_message(Inbound::Malformed(e.to_string())).await,
                    }
                }
            },
            Message::Pong(_) => {
                handle.touch(now_ms());
            },
            Message::Ping(_) => {
                handle.touch(now_ms());
            },
            Message::Close(_) => {
                return ReadPumpOutcome {
                    close_reason: CloseReason::Normal,
                };
            },
            Message::Binary(_) => {
                // Binary frames are not part of the application framing; ignore.
            },
        }
    }

    ReadPumpOutcome {
        close_reason: CloseReason::TransportError,
    }
}

/// Build an error application message ready to be serialized onto a
/// session's outbound queue.
#[must_use]
pub fn error_frame(message_id: &str, code: &'static str, detail: impl Into<String>) -> String {
    let msg = ApplicationMessage::Error(ErrorMessage::new(message_id, now_ms(), code, detail));
    serde_json::to_string(&msg).unwrap_or_else(|_| {
        format!(
            r#"{{"type":"error","message_id":"{message_id}","timestamp":{},"code":"{}","detail":"serialize failed"}}"#,
            now_ms(),
            error_codes::INTERNAL_ERROR
        )
    })
}

pub fn log_session_open(conn_id: &str, remote_ip: &str) {
    info!(conn_id, remote_ip, "session opened");
}
