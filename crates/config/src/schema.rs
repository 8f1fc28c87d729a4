//! Configuration schema for the gateway.
//!
//! Every field has a default so an empty file (or none at all) yields a
//! working single-node configuration. Field-level documentation mirrors the
//! configuration keys a deployment actually tunes.

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_read_buffer_size() -> usize {
    16 * 1024
}
fn default_write_buffer_size() -> usize {
    16 * 1024
}
fn default_max_message_size() -> usize {
    64 * 1024
}
fn default_write_wait_secs() -> u64 {
    10
}
fn default_pong_wait_secs() -> u64 {
    60
}
fn default_ping_period_secs() -> u64 {
    54
}
fn default_max_conns_per_ip() -> u32 {
    20
}
fn default_graceful_shutdown_wait_secs() -> u64 {
    30
}
fn default_outbound_queue_capacity() -> usize {
    256
}
fn default_slow_drop_threshold() -> u32 {
    64
}
fn default_slow_drop_window_secs() -> u64 {
    60
}

/// `server.*` — the upgrader and per-session I/O knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    pub write_wait_secs: u64,
    pub pong_wait_secs: u64,
    pub ping_period_secs: u64,
    pub max_conns_per_ip: u32,
    pub graceful_shutdown_wait_secs: u64,
    pub outbound_queue_capacity: usize,
    pub slow_drop_threshold: u32,
    pub slow_drop_window_secs: u64,
    /// Trust `X-Forwarded-For` for the client IP instead of the socket peer.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
            max_message_size: default_max_message_size(),
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            ping_period_secs: default_ping_period_secs(),
            max_conns_per_ip: default_max_conns_per_ip(),
            graceful_shutdown_wait_secs: default_graceful_shutdown_wait_secs(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            slow_drop_threshold: default_slow_drop_threshold(),
            slow_drop_window_secs: default_slow_drop_window_secs(),
            trust_forwarded_for: false,
        }
    }
}

fn default_token_expiry_secs() -> u64 {
    3600
}
fn default_auth_timeout_secs() -> u64 {
    10
}
fn default_require_auth_on_connect() -> bool {
    true
}
fn default_jwt_issuer() -> String {
    "gateway".into()
}

/// `auth.*` — Authenticator collaborator knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_expiry_secs: u64,
    pub auth_timeout_secs: u64,
    pub require_auth_on_connect: bool,
    /// Expected `iss` claim; tokens with a different issuer are rejected.
    pub jwt_issuer: String,
    /// HMAC signing secret. Read from `${GATEWAY_JWT_SECRET}` in practice —
    /// never commit a literal value here.
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_expiry_secs: default_token_expiry_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            require_auth_on_connect: default_require_auth_on_connect(),
            jwt_issuer: default_jwt_issuer(),
            jwt_secret: String::new(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

/// `cluster.*` — identity of this node within the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Unique node id stamped on every outbound Envelope. Generated at
    /// startup if left empty.
    pub node_id: String,
    pub heartbeat_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

fn default_pubsub_channel_prefix() -> String {
    "gateway".into()
}
fn default_handler_deadline_ms() -> u64 {
    5_000
}
fn default_publish_retry_delays_ms() -> Vec<u64> {
    vec![100, 500, 2_000]
}

/// `bus.*` — Bus collaborator knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub addresses: Vec<String>,
    pub pubsub_channel_prefix: String,
    pub handler_deadline_ms: u64,
    pub publish_retry_delays_ms: Vec<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            pubsub_channel_prefix: default_pubsub_channel_prefix(),
            handler_deadline_ms: default_handler_deadline_ms(),
            publish_retry_delays_ms: default_publish_retry_delays_ms(),
        }
    }
}

fn default_messages_per_second() -> f64 {
    20.0
}
fn default_burst() -> u32 {
    40
}
fn default_connections_per_user() -> u32 {
    8
}
fn default_global_connections() -> u32 {
    100_000
}
fn default_ip_bucket_ttl_secs() -> u64 {
    300
}

/// `rate_limit.*` — the three-tier admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-client inbound message rate (messages/sec).
    pub messages_per_second: f64,
    /// Per-client inbound burst capacity.
    pub burst: u32,
    pub connections_per_user: u32,
    pub global_connections: u32,
    /// Idle IP buckets older than this are pruned.
    pub ip_bucket_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: default_messages_per_second(),
            burst: default_burst(),
            connections_per_user: default_connections_per_user(),
            global_connections: default_global_connections(),
            ip_bucket_ttl_secs: default_ip_bucket_ttl_secs(),
        }
    }
}

fn default_shard_count() -> u32 {
    16
}
fn default_shard_key() -> String {
    "client_id".into()
}

/// `sharding.*` — connection registry partitioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Rounded up to the next power of two at load time.
    pub shard_count: u32,
    /// Reserved for future sharding strategies; only `client_id` is
    /// implemented today.
    pub shard_key: String,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            shard_key: default_shard_key(),
        }
    }
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

/// `router.*` — dispatch behavior not otherwise covered above.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Deliver direct/group messages back to the sending session (not just
    /// to the sending user's other devices). Source behavior here was
    /// inconsistent; default is `false`.
    pub deliver_to_self_session: bool,
    pub cleanup_interval_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            deliver_to_self_session: false,
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_metrics_bind() -> String {
    "0.0.0.0".into()
}
fn default_metrics_port() -> u16 {
    9090
}

/// `metrics.*` — the observability endpoint (separate port from `server`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_metrics_bind(),
            port: default_metrics_port(),
        }
    }
}

/// Root configuration document for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub cluster: ClusterConfig,
    pub bus: BusConfig,
    pub rate_limit: RateLimitConfig,
    pub sharding: ShardingConfig,
    pub router: RouterConfig,
    pub metrics: MetricsConfig,
}

impl GatewayConfig {
    /// Round `sharding.shard_count` up to the next power of two, and fill in
    /// a random `cluster.node_id` if one wasn't configured. Called once after
    /// load, before the Lifecycle Controller proceeds.
    pub fn normalize(&mut self) {
        self.sharding.shard_count = self.sharding.shard_count.max(1).next_power_of_two();
        if self.cluster.node_id.is_empty() {
            self.cluster.node_id = format!("node-{:08x}", rand::random::<u32>());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = GatewayConfig::default();
        let s = toml::to_string_pretty(&cfg).expect("serialize");
        let back: GatewayConfig = toml::from_str(&s).expect("deserialize");
        assert_eq!(back.server.port, cfg.server.port);
        assert_eq!(back.sharding.shard_count, cfg.sharding.shard_count);
    }

    #[test]
    fn normalize_rounds_shard_count_up() {
        let mut cfg = GatewayConfig {
            sharding: ShardingConfig {
                shard_count: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.normalize();
        assert_eq!(cfg.sharding.shard_count, 16);
    }

    #[test]
    fn normalize_leaves_power_of_two_untouched() {
        let mut cfg = GatewayConfig {
            sharding: ShardingConfig {
                shard_count: 32,
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.normalize();
        assert_eq!(cfg.sharding.shard_count, 32);
    }

    #[test]
    fn normalize_fills_node_id_when_absent() {
        let mut cfg = GatewayConfig::default();
        assert!(cfg.cluster.node_id.is_empty());
        cfg.normalize();
        assert!(cfg.cluster.node_id.starts_with("node-"));
    }
}
