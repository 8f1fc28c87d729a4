//! `wsgate-gateway`: the connection and routing plane. Accepts WebSocket
//! upgrades, authenticates sessions, enforces admission and message rate
//! limits, routes application messages to local recipients, and fans
//! addressed traffic out to other nodes over the bus.

pub mod auth;
pub mod bus;
pub mod error;
pub mod fanout;
pub mod http_metrics;
pub mod lifecycle;
pub mod observability;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod session;
pub mod state;
pub mod upgrader;

use std::{sync::Arc, time::Duration};

use axum::{Router as AxumRouter, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wsgate_config::GatewayConfig;

use crate::{
    auth::JwtAuthenticator,
    bus::InMemoryBus,
    error::{FatalError, Result},
    fanout::BusFanout,
    lifecycle::LifecycleController,
    rate_limit::RateLimiterTree,
    registry::ConnectionRegistry,
    router::{Router, RouterConfig},
    session::now_ms,
    state::GatewayState,
};

/// Build every collaborator from config and wire them into a `GatewayState`,
/// but don't start accepting connections yet — callers that only need the
/// wiring (tests, `wsgate config check`) stop here.
pub fn build_state(config: GatewayConfig) -> Result<Arc<GatewayState>> {
    let registry = Arc::new(ConnectionRegistry::new(config.sharding.shard_count as usize));
    let rate_limiter = Arc::new(RateLimiterTree::new(config.rate_limit.clone(), config.server.max_conns_per_ip));
    let bus: Arc<dyn bus::Bus> = Arc::new(InMemoryBus::new());
    let authenticator = Arc::new(JwtAuthenticator::new(&config.auth));
    let lifecycle = Arc::new(LifecycleController::new());

    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        Arc::clone(&bus),
        RouterConfig {
            node_id: config.cluster.node_id.clone(),
            channel_prefix: config.bus.pubsub_channel_prefix.clone(),
            deliver_to_self_session: config.router.deliver_to_self_session,
            publish_retry_delays_ms: config.bus.publish_retry_delays_ms.clone(),
        },
    ));

    let fanout = Arc::new(BusFanout::new(
        Arc::clone(&bus),
        config.cluster.node_id.clone(),
        config.bus.pubsub_channel_prefix.clone(),
        Duration::from_millis(config.bus.handler_deadline_ms),
        lifecycle.token(),
    ));

    let metrics_handle = wsgate_metrics::init_metrics(wsgate_metrics::MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        prefix: None,
        global_labels: vec![("node_id".into(), config.cluster.node_id.clone())],
    })
    .map_err(|e| FatalError::Config(format!("metrics init failed: {e}")))?;

    metrics::gauge!(
        wsgate_metrics::system::BUILD_INFO,
        wsgate_metrics::labels::VERSION => env!("CARGO_PKG_VERSION")
    )
    .set(1.0);

    Ok(Arc::new(GatewayState {
        config,
        registry,
        rate_limiter,
        bus,
        fanout,
        router,
        authenticator,
        lifecycle,
        metrics_handle,
        started_at_ms: now_ms(),
    }))
}

/// Full startup sequence: wire the state, subscribe to the shared bus
/// channel, bind both listeners, and run until shutdown.
pub async fn run(config: GatewayConfig) -> Result<()> {
    if let Ok(hostname) = hostname::get() {
        info!(hostname = %hostname.to_string_lossy(), node_id = %config.cluster.node_id, "gateway starting");
    }

    let state = build_state(config)?;
    state.fanout.start_broadcast_subscription(Arc::clone(&state.router));

    let shutdown_token = state.lifecycle.token();

    let connection_app = AxumRouter::new()
        .route("/ws", get(upgrader::ws_upgrade_handler))
        .layer(axum::middleware::from_fn(http_metrics::http_metrics_middleware))
        .with_state(Arc::clone(&state));

    let bind_addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| FatalError::Bind(format!("{bind_addr}: {e}")))?;
    info!(addr = %bind_addr, "connection listener bound");

    let metrics_app: Option<AxumRouter> = state.config.metrics.enabled.then(|| observability::router(Arc::clone(&state)));
    let metrics_listener = if let Some(_app) = &metrics_app {
        let metrics_addr = format!("{}:{}", state.config.metrics.bind, state.config.metrics.port);
        let listener = TcpListener::bind(&metrics_addr)
            .await
            .map_err(|e| FatalError::Bind(format!("{metrics_addr}: {e}")))?;
        info!(addr = %metrics_addr, "observability listener bound");
        Some(listener)
    } else {
        None
    };

    let sweeper = spawn_sweeper(Arc::clone(&state), shutdown_token.clone());

    let serve_connections = async {
        axum::serve(listener, connection_app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .with_graceful_shutdown(shutdown_token.clone().cancelled_owned())
            .await
    };

    if let (Some(metrics_listener), Some(metrics_app)) = (metrics_listener, metrics_app) {
        let serve_metrics = async {
            axum::serve(metrics_listener, metrics_app.into_make_service())
                .with_graceful_shutdown(shutdown_token.clone().cancelled_owned())
                .await
        };
        tokio::select! {
            res = serve_connections => { if let Err(e) = res { tracing::error!(error = %e, "connection listener exited"); } }
            res = serve_metrics => { if let Err(e) = res { tracing::error!(error = %e, "observability listener exited"); } }
            () = wait_for_shutdown_signal() => { state.lifecycle.token().cancel(); }
        }
    } else {
        tokio::select! {
            res = serve_connections => { if let Err(e) = res { tracing::error!(error = %e, "connection listener exited"); } }
            () = wait_for_shutdown_signal() => { state.lifecycle.token().cancel(); }
        }
    }

    let deadline = Duration::from_secs(state.config.server.graceful_shutdown_wait_secs);
    state.lifecycle.shutdown(&state.registry, deadline).await;
    sweeper.abort();
    info!("gateway stopped");
    Ok(())
}

/// Waits for either SIGINT or SIGTERM (the orchestrator's preferred signal
/// for a graceful stop) and returns once either fires.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler, falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                info!("received ctrl-c, beginning shutdown");
                return;
            },
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, beginning shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, beginning shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, beginning shutdown");
    }
}

/// Periodically prunes stale IP buckets and heartbeat-timed-out sessions
/// that the per-session ping/pong loop alone wouldn't catch (e.g. a
/// connection whose write pump is itself wedged).
fn spawn_sweeper(state: Arc<GatewayState>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(state.config.router.cleanup_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    state.rate_limiter.cleanup_ip_buckets().await;
                    // §4.2: stale sessions are swept at 2x pong_wait, giving a
                    // connection whose heartbeat is merely slow one extra
                    // pong_wait before the sweeper (not just the per-session
                    // ping/pong loop) calls it dead.
                    let cutoff = now_ms() - (2 * state.config.server.pong_wait_secs as i64 * 1000);
                    let closed = state.registry.cleanup_stale(cutoff).await;
                    if closed > 0 {
                        metrics::counter!(wsgate_metrics::websocket::HEARTBEAT_TIMEOUTS_TOTAL).increment(closed as u64);
                        info!(closed, "sweeper: closed stale sessions");
                    }
                    for shard in state.registry.stats().await {
                        metrics::gauge!(
                            wsgate_metrics::websocket::SHARD_CONNECTIONS,
                            wsgate_metrics::labels::SHARD_ID => shard.shard_id.to_string()
                        )
                        .set(shard.connections as f64);
                    }
                    metrics::gauge!(wsgate_metrics::system::UPTIME_SECONDS)
                        .set(((now_ms() - state.started_at_ms) / 1000) as f64);
                }
                () = shutdown.cancelled() => return,
            }
        }
    })
}
