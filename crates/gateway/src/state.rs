//! Shared gateway state: every long-lived collaborator the upgrader,
//! router, and observability endpoints need a handle to, wired together
//! once at startup and handed around as a single `Arc`.

use std::sync::Arc;

use wsgate_config::GatewayConfig;

use crate::{
    auth::Authenticator, bus::Bus, fanout::BusFanout, lifecycle::LifecycleController,
    rate_limit::RateLimiterTree, registry::ConnectionRegistry, router::Router,
};

pub struct GatewayState {
    pub config: GatewayConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub rate_limiter: Arc<RateLimiterTree>,
    pub bus: Arc<dyn Bus>,
    pub fanout: Arc<BusFanout>,
    pub router: Arc<Router>,
    pub authenticator: Arc<dyn Authenticator>,
    pub lifecycle: Arc<LifecycleController>,
    pub metrics_handle: wsgate_metrics::MetricsHandle,
    pub started_at_ms: i64,
}
