//! Upgrader: the HTTP -> WebSocket boundary. Admits the connection (IP and
//! global rate limits), resolves the client's identity (pre-auth header or
//! the post-connect `auth` message), and spawns the read/write pumps.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade, ws::WebSocket},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::StreamExt;
use tracing::{info, warn};
use wsgate_protocol::{ApplicationMessage, CloseReason, error_codes};

use crate::{
    auth::Authenticator,
    registry::{ConnectionHandle, OutboundItem},
    router::{Router, SenderContext, auth_required_frame, unknown_type_frame},
    session::{Inbound, SessionLimits, SlowDropTracker, enqueue_or_drop, error_frame, log_session_open, now_ms, read_pump, write_pump},
    state::GatewayState,
};

/// Extract the client's IP, respecting `X-Forwarded-For` only when the
/// deployment has opted in (`server.trust_forwarded_for`) — otherwise a
/// spoofed header would let a client evade the per-IP rate limit entirely.
fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for
        && let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = xff.split(',').next()
    {
        let ip = first.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

/// Pull a bearer token from either the `Authorization` header or the
/// `Sec-WebSocket-Protocol` negotiation (browsers can't set arbitrary
/// headers on a WebSocket handshake, so this is the only channel available
/// to browser clients).
fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        return Some(auth.to_string());
    }
    headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let ip = client_ip(&headers, peer, state.config.server.trust_forwarded_for);

    if !state.rate_limiter.admit_ip(&ip).await {
        metrics::counter!(
            wsgate_metrics::rate_limit::HITS_TOTAL,
            wsgate_metrics::labels::REASON => "ip"
        )
        .increment(1);
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }
    if !state.rate_limiter.admit_global() {
        metrics::counter!(
            wsgate_metrics::rate_limit::HITS_TOTAL,
            wsgate_metrics::labels::REASON => "global"
        )
        .increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "at capacity").into_response();
    }

    let token = extract_token(&headers);
    let require_auth_on_connect = state.config.auth.require_auth_on_connect;

    // When auth is required at connect time, resolve identity before the
    // upgrade completes so an unauthenticated peer never gets a socket.
    let pre_identity = if require_auth_on_connect {
        let Some(token) = token else {
            let err = crate::error::AuthError::Missing;
            metrics::counter!(wsgate_metrics::auth::FAILURES_TOTAL).increment(1);
            warn!(error = %err, "upgrader: rejected at connect");
            return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
        };
        match state.authenticator.validate(&token).await {
            Ok(identity) => Some(identity),
            Err(e) => {
                metrics::counter!(wsgate_metrics::auth::FAILURES_TOTAL).increment(1);
                warn!(error = %e, "upgrader: rejected at connect");
                return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
            },
        }
    } else {
        None
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, ip, peer, pre_identity))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    remote_ip: String,
    peer: SocketAddr,
    pre_identity: Option<crate::auth::Identity>,
) {
    let client_id = rand::random::<u64>();
    let conn_id = format!("{client_id:016x}");
    log_session_open(&conn_id, &remote_ip);

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(state.config.server.outbound_queue_capacity);
    let handle = Arc::new(ConnectionHandle {
        client_id,
        remote_ip: remote_ip.clone(),
        user_id: std::sync::OnceLock::new(),
        device_id: std::sync::OnceLock::new(),
        authenticated: std::sync::atomic::AtomicBool::new(false),
        connected_at_ms: now_ms(),
        last_activity_ms: Arc::new(std::sync::atomic::AtomicI64::new(now_ms())),
        outbound: outbound_tx,
    });

    state.registry.add(Arc::clone(&handle)).await;
    state.rate_limiter.note_connection_opened();
    metrics::gauge!(wsgate_metrics::websocket::ACTIVE_CONNECTIONS).increment(1.0);
    metrics::counter!(wsgate_metrics::websocket::TOTAL_CONNECTIONS).increment(1);

    if let Some(identity) = pre_identity {
        authenticate(&state, &handle, identity).await;
    } else {
        spawn_auth_watchdog(Arc::clone(&state), Arc::clone(&handle));
    }

    let (sink, stream) = socket.split();
    let limits = SessionLimits {
        max_message_size: state.config.server.max_message_size,
        write_wait: Duration::from_secs(state.config.server.write_wait_secs),
        pong_wait: Duration::from_secs(state.config.server.pong_wait_secs),
        ping_period: Duration::from_secs(state.config.server.ping_period_secs),
        outbound_queue_capacity: state.config.server.outbound_queue_capacity,
        slow_drop_threshold: state.config.server.slow_drop_threshold,
        slow_drop_window: Duration::from_secs(state.config.server.slow_drop_window_secs),
    };

    let write_task = tokio::spawn(write_pump(
        sink,
        outbound_rx,
        Arc::clone(&handle),
        limits.clone(),
        conn_id.clone(),
    ));

    let message_bucket = Arc::new(crate::rate_limit::MessageBucket::new(&state.config.rate_limit));
    let slow_drop_tracker = Arc::new(SlowDropTracker::new(limits.slow_drop_threshold, limits.slow_drop_window));
    let max_message_size = limits.max_message_size;

    let dispatch_state = Arc::clone(&state);
    let dispatch_handle = Arc::clone(&handle);
    let dispatch_tracker = Arc::clone(&slow_drop_tracker);
    let outcome = read_pump(stream, Arc::clone(&handle), message_bucket, max_message_size, move |inbound| {
        let state = Arc::clone(&dispatch_state);
        let handle = Arc::clone(&dispatch_handle);
        let tracker = Arc::clone(&dispatch_tracker);
        async move {
            on_inbound(&state, &handle, &tracker, inbound).await;
        }
    })
    .await;

    write_task.abort();
    finalize_session(&state, &handle, &conn_id, outcome.close_reason).await;
}

async fn authenticate(state: &Arc<GatewayState>, handle: &Arc<ConnectionHandle>, identity: crate::auth::Identity) {
    if !state.rate_limiter.admit_user(&identity.user_id).await {
        metrics::counter!(
            wsgate_metrics::rate_limit::HITS_TOTAL,
            wsgate_metrics::labels::REASON => "user"
        )
        .increment(1);
        handle.try_close(CloseReason::UserLimit);
        return;
    }
    metrics::counter!(wsgate_metrics::auth::ATTEMPTS_TOTAL).increment(1);
    let superseded = state
        .registry
        .register_authenticated(handle.client_id, identity.user_id.clone(), identity.device_id.as_deref())
        .await;
    if superseded.is_some() {
        metrics::counter!(wsgate_metrics::websocket::SUPERSEDED_TOTAL).increment(1);
    }
    state.fanout.ensure_user_subscription(identity.user_id, Arc::clone(&state.router)).await;
}

fn spawn_auth_watchdog(state: Arc<GatewayState>, handle: Arc<ConnectionHandle>) {
    let deadline = Duration::from_secs(state.config.auth.auth_timeout_secs);
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        if !handle.is_authenticated() {
            info!(client_id = handle.client_id, "upgrader: auth deadline exceeded, closing");
            handle.try_close(CloseReason::AuthTimeout);
        }
    });
}

async fn on_inbound(
    state: &Arc<GatewayState>,
    handle: &Arc<ConnectionHandle>,
    tracker: &Arc<SlowDropTracker>,
    inbound: Inbound,
) {
    match inbound {
        Inbound::Message(ApplicationMessage::Auth(auth_msg)) => {
            match state.authenticator.validate(&auth_msg.token).await {
                Ok(identity) => authenticate(state, handle, identity).await,
                Err(e) => {
                    metrics::counter!(wsgate_metrics::auth::FAILURES_TOTAL).increment(1);
                    warn!(client_id = handle.client_id, error = %e, "upgrader: auth message rejected");
                    enqueue_or_drop(handle, tracker, error_frame(&auth_msg.message_id, error_codes::AUTH_FAILED, e.to_string()));
                },
            }
        },
        Inbound::Message(message) => {
            if !handle.is_authenticated() {
                enqueue_or_drop(handle, tracker, auth_required_frame(message.message_id()));
                return;
            }
            let sender = SenderContext {
                client_id: handle.client_id,
                user_id: handle.user_id().unwrap_or_default().to_string(),
            };
            let started = std::time::Instant::now();
            state.router.dispatch(&sender, message).await;
            metrics::histogram!(wsgate_metrics::websocket::MESSAGE_LATENCY_SECONDS)
                .record(started.elapsed().as_secs_f64());
        },
        Inbound::RateLimited => {
            metrics::counter!(
                wsgate_metrics::errors::ERRORS_TOTAL,
                wsgate_metrics::labels::ERROR_TYPE => "rate_limited"
            )
            .increment(1);
            enqueue_or_drop(handle, tracker, error_frame("unknown", error_codes::RATE_LIMIT_EXCEEDED, "message rate limit exceeded"));
        },
        Inbound::TooLarge { actual, max } => {
            metrics::counter!(
                wsgate_metrics::errors::ERRORS_TOTAL,
                wsgate_metrics::labels::ERROR_TYPE => "message_too_large"
            )
            .increment(1);
            enqueue_or_drop(
                handle,
                tracker,
                error_frame("unknown", error_codes::MESSAGE_TOO_LARGE, format!("{actual} bytes exceeds max {max}")),
            );
        },
        Inbound::Malformed(detail) => {
            metrics::counter!(
                wsgate_metrics::errors::ERRORS_TOTAL,
                wsgate_metrics::labels::ERROR_TYPE => "unknown_type"
            )
            .increment(1);
            enqueue_or_drop(handle, tracker, unknown_type_frame("unknown", detail));
        },
    }
}

async fn finalize_session(state: &Arc<GatewayState>, handle: &Arc<ConnectionHandle>, conn_id: &str, reason: CloseReason) {
    if let Some(user_id) = handle.user_id() {
        state.rate_limiter.release_user(user_id).await;
    }
    state.registry.remove(handle.client_id).await;
    state.rate_limiter.note_connection_closed();
    metrics::gauge!(wsgate_metrics::websocket::ACTIVE_CONNECTIONS).decrement(1.0);
    info!(conn_id, reason = reason.as_str(), "session closed");
}
