//! Wire protocol for the gateway: the application message framing clients
//! speak over the WebSocket, and the envelope the bus adapter wraps around
//! messages in transit between nodes.
//!
//! Application frames are UTF-8 JSON, newline-delimited when coalesced on
//! the write side. Each frame carries a `type` discriminator, a
//! `message_id`, and a `timestamp` (ms since epoch) alongside type-specific
//! fields.

use serde::{Deserialize, Serialize};

// ── Error codes ──────────────────────────────────────────────────────────────

/// Error frame codes sent back to a client over the WebSocket.
pub mod error_codes {
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Reasons a session's connection was closed, reported in the close frame
/// sent to the client (and used for logging/metrics on the server side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    AuthTimeout,
    Superseded,
    UserLimit,
    HeartbeatTimeout,
    ClientSlowAbuse,
    ServerShutdown,
    ProtocolViolation,
    TransportError,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::AuthTimeout => "auth_timeout",
            Self::Superseded => "superseded",
            Self::UserLimit => "user_limit",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ClientSlowAbuse => "client_slow_abuse",
            Self::ServerShutdown => "server_shutdown",
            Self::ProtocolViolation => "protocol_violation",
            Self::TransportError => "transport_error",
        }
    }
}

// ── Application message ─────────────────────────────────────────────────────

/// A message exchanged between a client and the gateway, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplicationMessage {
    Auth(AuthMessage),
    Direct(DirectMessage),
    Group(GroupMessage),
    Typing(TypingMessage),
    Presence(PresenceMessage),
    Ack(AckMessage),
    Error(ErrorMessage),
    Heartbeat(HeartbeatMessage),
}

impl ApplicationMessage {
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Auth(m) => &m.message_id,
            Self::Direct(m) => &m.message_id,
            Self::Group(m) => &m.message_id,
            Self::Typing(m) => &m.message_id,
            Self::Presence(m) => &m.message_id,
            Self::Ack(m) => &m.message_id,
            Self::Error(m) => &m.message_id,
            Self::Heartbeat(m) => &m.message_id,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Direct(_) => "direct",
            Self::Group(_) => "group",
            Self::Typing(_) => "typing",
            Self::Presence(_) => "presence",
            Self::Ack(_) => "ack",
            Self::Error(_) => "error",
            Self::Heartbeat(_) => "heartbeat",
        }
    }
}

/// Sent by an unauthenticated session to establish identity. Until the
/// gateway accepts this, every other message type is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMessage {
    pub message_id: String,
    pub timestamp: i64,
    pub token: String,
}

/// Addressed to a single user (all of that user's devices, per the
/// session's delivery configuration). `from` is stamped by the router with
/// the sender's authenticated user-id — a client-supplied value is ignored
/// and overwritten, never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessage {
    pub message_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub from: String,
    pub to_user_id: String,
    pub body: serde_json::Value,
}

/// Addressed to every member of a group/channel. `from` is stamped by the
/// router the same way as `DirectMessage::from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    pub message_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub from: String,
    pub group_id: String,
    pub body: serde_json::Value,
}

/// Best-effort, drop-on-full typing indicator. `from` is stamped by the
/// router the same way as `DirectMessage::from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingMessage {
    pub message_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub from: String,
    pub to_user_id: String,
    pub is_typing: bool,
}

/// Best-effort, drop-on-full presence update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub message_id: String,
    pub timestamp: i64,
    pub status: String,
}

/// Local-only acknowledgement of a previously received message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    pub message_id: String,
    pub timestamp: i64,
    pub acked_message_id: String,
}

/// Server-to-client (or occasionally client-to-server) error notification.
/// Never routed to another session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message_id: String,
    pub timestamp: i64,
    pub code: String,
    pub detail: String,
}

impl ErrorMessage {
    #[must_use]
    pub fn new(message_id: impl Into<String>, timestamp: i64, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            timestamp,
            code: code.into(),
            detail: detail.into(),
        }
    }
}

/// Client-initiated heartbeat payload, handled locally by the session (the
/// transport-level ping/pong is separate and invisible to the application
/// framing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub message_id: String,
    pub timestamp: i64,
}

// ── Bus envelope ─────────────────────────────────────────────────────────────

/// Wraps an application message (or any routed payload) for transit over
/// the bus between gateway nodes. `node_id` identifies the node that
/// published the envelope, used for loop suppression on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub origin_node_id: String,
    pub published_at_ms: i64,
    pub payload: serde_json::Value,
}

impl Envelope {
    #[must_use]
    pub fn new(origin_node_id: impl Into<String>, published_at_ms: i64, payload: serde_json::Value) -> Self {
        Self {
            origin_node_id: origin_node_id.into(),
            published_at_ms,
            payload,
        }
    }

    /// Whether this envelope originated on `local_node_id` and should be
    /// silently discarded rather than re-delivered.
    #[must_use]
    pub fn originated_locally(&self, local_node_id: &str) -> bool {
        self.origin_node_id == local_node_id
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_round_trips_through_json() {
        let msg = ApplicationMessage::Auth(AuthMessage {
            message_id: "m1".into(),
            timestamp: 1000,
            token: "jwt-token".into(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"auth\""));
        let round_tripped: ApplicationMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped.type_name(), "auth");
        assert_eq!(round_tripped.message_id(), "m1");
    }

    #[test]
    fn direct_message_carries_recipient_and_body() {
        let msg = ApplicationMessage::Direct(DirectMessage {
            message_id: "m2".into(),
            timestamp: 2000,
            from: "u1".into(),
            to_user_id: "u2".into(),
            body: serde_json::json!({"text": "hi"}),
        });
        match &msg {
            ApplicationMessage::Direct(d) => assert_eq!(d.to_user_id, "u2"),
            _ => panic!("expected direct message"),
        }
    }

    #[test]
    fn direct_message_from_defaults_when_absent_from_wire() {
        let raw = r#"{"type":"direct","message_id":"m4","timestamp":4000,"to_user_id":"u2","body":{}}"#;
        let parsed: ApplicationMessage = serde_json::from_str(raw).unwrap();
        match parsed {
            ApplicationMessage::Direct(d) => assert_eq!(d.from, ""),
            _ => panic!("expected direct message"),
        }
    }

    #[test]
    fn unknown_type_fails_to_deserialize() {
        let raw = r#"{"type":"bogus","message_id":"m3","timestamp":3000}"#;
        let result: Result<ApplicationMessage, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn envelope_detects_local_origin() {
        let env = Envelope::new("node-a", 1234, serde_json::json!({}));
        assert!(env.originated_locally("node-a"));
        assert!(!env.originated_locally("node-b"));
    }

    #[test]
    fn close_reason_as_str_matches_spec_codes() {
        assert_eq!(CloseReason::Superseded.as_str(), "superseded");
        assert_eq!(CloseReason::ClientSlowAbuse.as_str(), "client_slow_abuse");
    }
}
