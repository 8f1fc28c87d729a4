//! Metric name and label definitions.
//!
//! Centralizing these names as constants keeps the emitting call sites and
//! the Prometheus-bucket configuration in `recorder.rs` in sync.

/// HTTP request metrics (the upgrade endpoint and observability endpoint).
pub mod http {
    pub const REQUESTS_TOTAL: &str = "gateway_http_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_http_request_duration_seconds";
    pub const REQUESTS_IN_FLIGHT: &str = "gateway_http_requests_in_flight";
}

/// Connection and session lifecycle metrics.
pub mod websocket {
    /// Gauge: currently open sessions.
    pub const ACTIVE_CONNECTIONS: &str = "gateway_active_connections";
    /// Counter: total sessions ever accepted.
    pub const TOTAL_CONNECTIONS: &str = "gateway_total_connections";
    pub const MESSAGES_RECEIVED_TOTAL: &str = "gateway_messages_received_total";
    pub const MESSAGES_SENT_TOTAL: &str = "gateway_messages_sent_total";
    /// Histogram: end-to-end dispatch latency, buckets in `buckets::MESSAGE_LATENCY`.
    pub const MESSAGE_LATENCY_SECONDS: &str = "gateway_message_latency_seconds";
    /// Gauge vector, labelled by `shard_id`.
    pub const SHARD_CONNECTIONS: &str = "gateway_shard_connections";
    pub const SLOW_DROPS_TOTAL: &str = "gateway_slow_drops_total";
    pub const SUPERSEDED_TOTAL: &str = "gateway_superseded_total";
    pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "gateway_heartbeat_timeouts_total";
}

/// Authentication metrics.
pub mod auth {
    pub const ATTEMPTS_TOTAL: &str = "gateway_auth_attempts_total";
    pub const FAILURES_TOTAL: &str = "gateway_auth_failures_total";
}

/// Rate limiting and admission metrics.
pub mod rate_limit {
    pub const HITS_TOTAL: &str = "gateway_rate_limit_hits_total";
}

/// Bus adapter metrics.
pub mod bus {
    pub const PUBLISHED_TOTAL: &str = "gateway_bus_published_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "gateway_bus_publish_failures_total";
    pub const RECEIVED_TOTAL: &str = "gateway_bus_received_total";
    pub const LOOP_SUPPRESSED_TOTAL: &str = "gateway_bus_loop_suppressed_total";
    pub const HANDLER_TIMEOUTS_TOTAL: &str = "gateway_bus_handler_timeouts_total";
    pub const RECONNECTS_TOTAL: &str = "gateway_bus_reconnects_total";
}

/// Taxonomy-wide error counter, labelled by `error_type`.
pub mod errors {
    pub const ERRORS_TOTAL: &str = "gateway_errors_total";
}

/// Process/system metrics.
pub mod system {
    pub const UPTIME_SECONDS: &str = "gateway_uptime_seconds";
    pub const BUILD_INFO: &str = "gateway_build_info";
}

/// Common label keys used across the metrics above.
pub mod labels {
    pub const ENDPOINT: &str = "endpoint";
    pub const METHOD: &str = "method";
    pub const STATUS: &str = "status";
    pub const ERROR_TYPE: &str = "error_type";
    pub const SHARD_ID: &str = "shard_id";
    pub const REASON: &str = "reason";
    pub const VERSION: &str = "version";
}

/// Standard histogram buckets.
pub mod buckets {
    use once_cell::sync::Lazy;

    /// HTTP request duration buckets (in seconds). Covers 1ms to 30s.
    pub static HTTP_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ]
    });

    /// `gateway_message_latency_seconds` buckets, per the observability
    /// endpoint's {1,5,10,25,50,100,250,500,1000} ms spec.
    pub static MESSAGE_LATENCY: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
        ]
    });
}
