//! Configuration loading, validation, and env substitution for the gateway.
//!
//! Config files: `gateway.toml`, `gateway.yaml`, or `gateway.json`.
//! Searched in `./` then `~/.config/wsgate/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_or_default_config_path, save_config},
    schema::{
        AuthConfig, BusConfig, ClusterConfig, GatewayConfig, MetricsConfig, RateLimitConfig,
        RouterConfig, ServerConfig, ShardingConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
