//! Gateway error taxonomy.
//!
//! Each variant corresponds to one of the failure categories a client
//! session or the lifecycle controller can hit: authentication, admission
//! (rate limiting / capacity), protocol framing, flow control, transport,
//! the bus adapter, and unrecoverable startup/shutdown failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("ip rate limit exceeded")]
    IpRateLimited,
    #[error("per-user connection limit exceeded")]
    UserLimited,
    #[error("global connection limit exceeded")]
    GlobalLimited,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("message exceeds max size ({actual} > {max})")]
    TooLarge { actual: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("message rate limit exceeded")]
    RateLimited,
    #[error("outbound queue full, session closed")]
    Backpressure,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Websocket(String),
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("handler deadline exceeded")]
    HandlerTimeout,
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("bind failed: {0}")]
    Bind(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Top-level union of every gateway error category.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl GatewayError {
    /// Stable label used for the `gateway_errors_total{error_type}` metric.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Admission(_) => "admission",
            Self::Protocol(_) => "protocol",
            Self::Flow(FlowError::Backpressure) => "client_slow",
            Self::Flow(_) => "flow",
            Self::Transport(_) => "transport",
            Self::Bus(_) => "bus",
            Self::Fatal(_) => "fatal",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
