//! Configuration validation.
//!
//! Parses a candidate config document, flags unknown/misspelled top-level
//! and nested keys, and runs a handful of semantic sanity checks before the
//! Lifecycle Controller is allowed to proceed.

use std::{collections::HashMap, path::Path};

use crate::schema::GatewayConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "range", "security"
    pub category: &'static str,
    /// Dotted path, e.g. "server.prot"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, Struct};

    Struct(HashMap::from([
        (
            "server",
            Struct(HashMap::from([
                ("host", Leaf),
                ("port", Leaf),
                ("read_buffer_size", Leaf),
                ("write_buffer_size", Leaf),
                ("max_message_size", Leaf),
                ("write_wait_secs", Leaf),
                ("pong_wait_secs", Leaf),
                ("ping_period_secs", Leaf),
                ("max_conns_per_ip", Leaf),
                ("graceful_shutdown_wait_secs", Leaf),
                ("outbound_queue_capacity", Leaf),
                ("slow_drop_threshold", Leaf),
                ("slow_drop_window_secs", Leaf),
                ("trust_forwarded_for", Leaf),
            ])),
        ),
        (
            "auth",
            Struct(HashMap::from([
                ("token_expiry_secs", Leaf),
                ("auth_timeout_secs", Leaf),
                ("require_auth_on_connect", Leaf),
                ("jwt_issuer", Leaf),
                ("jwt_secret", Leaf),
            ])),
        ),
        (
            "cluster",
            Struct(HashMap::from([
                ("node_id", Leaf),
                ("heartbeat_interval_secs", Leaf),
            ])),
        ),
        (
            "bus",
            Struct(HashMap::from([
                ("addresses", Leaf),
                ("pubsub_channel_prefix", Leaf),
                ("handler_deadline_ms", Leaf),
                ("publish_retry_delays_ms", Leaf),
            ])),
        ),
        (
            "rate_limit",
            Struct(HashMap::from([
                ("messages_per_second", Leaf),
                ("burst", Leaf),
                ("connections_per_user", Leaf),
                ("global_connections", Leaf),
                ("ip_bucket_ttl_secs", Leaf),
            ])),
        ),
        (
            "sharding",
            Struct(HashMap::from([("shard_count", Leaf), ("shard_key", Leaf)])),
        ),
        (
            "router",
            Struct(HashMap::from([
                ("deliver_to_self_session", Leaf),
                ("cleanup_interval_secs", Leaf),
            ])),
        ),
        (
            "metrics",
            Struct(HashMap::from([
                ("enabled", Leaf),
                ("bind", Leaf),
                ("port", Leaf),
            ])),
        ),
    ]))
}

// ── Levenshtein distance ─────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let a_len = a.len();
    let b_len = b.len();
    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

// ── Core validation ──────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = if let Some(p) = path {
        Some(p.to_path_buf())
    } else {
        crate::loader::find_config_file()
    };

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    match std::fs::read_to_string(actual_path) {
        Ok(content) => {
            let mut result = validate_toml_str(&content);
            result.config_path = Some(actual_path.clone());
            result
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("failed to read config file: {e}"),
            }],
            config_path: Some(actual_path.clone()),
        },
    }
}

/// Validate a TOML string without touching the filesystem.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("TOML syntax error: {e}"),
            });
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    let schema = build_schema_map();
    check_unknown_fields(&toml_value, &schema, "", &mut diagnostics);

    if let Err(e) = toml::from_str::<GatewayConfig>(toml_str) {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        });
    }

    if let Ok(config) = toml::from_str::<GatewayConfig>(toml_str) {
        check_semantic_warnings(&config, &mut diagnostics);
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (toml::Value::Table(table), KnownKeys::Struct(fields)) => {
            let known_keys: Vec<&str> = fields.keys().copied().collect();
            for (key, child_value) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                } else {
                    let suggestion = suggest(key, &known_keys, 3);
                    let msg = if let Some(s) = suggestion {
                        format!("unknown field (did you mean \"{s}\"?)")
                    } else {
                        "unknown field".to_string()
                    };
                    diagnostics.push(Diagnostic {
                        severity: Severity::Error,
                        category: "unknown-field",
                        path,
                        message: msg,
                    });
                }
            }
        },
        _ => {},
    }
}

fn check_semantic_warnings(config: &GatewayConfig, diagnostics: &mut Vec<Diagnostic>) {
    let is_localhost = config.server.host == "127.0.0.1"
        || config.server.host == "localhost"
        || config.server.host == "::1";

    if !config.auth.require_auth_on_connect && !is_localhost {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            category: "security",
            path: "auth.require_auth_on_connect".into(),
            message: format!(
                "auth-on-connect is disabled while binding to {}",
                config.server.host
            ),
        });
    }

    if config.auth.require_auth_on_connect && config.auth.jwt_secret.is_empty() {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            category: "security",
            path: "auth.jwt_secret".into(),
            message: "auth is required but jwt_secret is empty".into(),
        });
    }

    if config.server.port == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Info,
            category: "range",
            path: "server.port".into(),
            message: "port is 0; a random port will be assigned at startup".into(),
        });
    }

    if !config.sharding.shard_count.is_power_of_two() {
        diagnostics.push(Diagnostic {
            severity: Severity::Info,
            category: "range",
            path: "sharding.shard_count".into(),
            message: format!(
                "shard_count {} is not a power of two; it will be rounded up at load time",
                config.sharding.shard_count
            ),
        });
    }

    if config.rate_limit.burst < 1 {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "range",
            path: "rate_limit.burst".into(),
            message: "burst must be at least 1".into(),
        });
    }

    if config.rate_limit.connections_per_user == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "range",
            path: "rate_limit.connections_per_user".into(),
            message: "connections_per_user must be at least 1".into(),
        });
    }

    if config.server.ping_period_secs >= config.server.pong_wait_secs {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            category: "range",
            path: "server.ping_period_secs".into(),
            message: "ping_period_secs should be smaller than pong_wait_secs".into(),
        });
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_top_level_key_with_suggestion() {
        let result = validate_toml_str("servr = {}\n");
        let unknown = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field" && d.path == "servr");
        assert!(unknown.is_some());
        assert!(unknown.unwrap().message.contains("server"));
    }

    #[test]
    fn unknown_nested_key_with_suggestion() {
        let toml = "[server]\nprt = 9000\n";
        let result = validate_toml_str(toml);
        let unknown = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field" && d.path == "server.prt");
        assert!(unknown.is_some());
        assert!(unknown.unwrap().message.contains("port"));
    }

    #[test]
    fn empty_config_is_valid() {
        let result = validate_toml_str("");
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn syntax_error_detected() {
        let result = validate_toml_str("this is not [[[ valid");
        assert!(result.has_errors());
    }

    #[test]
    fn auth_required_without_secret_warns() {
        let toml = "[auth]\nrequire_auth_on_connect = true\njwt_secret = \"\"\n";
        let result = validate_toml_str(toml);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "auth.jwt_secret")
        );
    }

    #[test]
    fn non_power_of_two_shard_count_is_info_not_error() {
        let toml = "[sharding]\nshard_count = 10\n";
        let result = validate_toml_str(toml);
        let diag = result
            .diagnostics
            .iter()
            .find(|d| d.path == "sharding.shard_count")
            .expect("diagnostic present");
        assert_eq!(diag.severity, Severity::Info);
    }

    #[test]
    fn zero_burst_is_error() {
        let toml = "[rate_limit]\nburst = 0\n";
        let result = validate_toml_str(toml);
        assert!(result.has_errors());
    }

    #[test]
    fn ping_period_exceeding_pong_wait_warns() {
        let toml = "[server]\nping_period_secs = 120\npong_wait_secs = 60\n";
        let result = validate_toml_str(toml);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "server.ping_period_secs")
        );
    }

    #[test]
    fn port_zero_is_info() {
        let toml = "[server]\nport = 0\n";
        let result = validate_toml_str(toml);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "server.port" && d.severity == Severity::Info)
        );
    }
}
