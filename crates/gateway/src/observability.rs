//! The observability endpoint: `/health`, `/stats`, and `/metrics`, served
//! on their own port so a scraper or load balancer probe never contends
//! with the connection-plane listener.

use std::sync::Arc;

use axum::{
    Router as AxumRouter,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};

use crate::{http_metrics::http_metrics_middleware, session::now_ms, state::GatewayState};

pub fn router(state: Arc<GatewayState>) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(http_metrics_middleware))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": now_ms(),
        "node_id": state.config.cluster.node_id,
        "connections": state.registry.global_connections(),
        "uptime_secs": (now_ms() - state.started_at_ms) / 1000,
    }))
}

async fn stats_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let shards = state.registry.stats().await;
    Json(serde_json::json!({
        "global_connections": state.registry.global_connections(),
        "shard_count": state.registry.shard_count(),
        "shards": shards.iter().map(|s| serde_json::json!({
            "shard_id": s.shard_id,
            "connections": s.connections,
        })).collect::<Vec<_>>(),
        "rate_limit_hits": state.rate_limiter.total_hits(),
    }))
}

async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    if !state.config.metrics.enabled {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response();
    }
    let body = state.metrics_handle.render();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
