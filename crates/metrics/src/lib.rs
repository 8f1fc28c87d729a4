//! Metrics collection and export for the gateway.
//!
//! This crate provides a unified metrics interface using the `metrics` crate facade.
//! When the `prometheus` feature is enabled, metrics are exported in Prometheus format.
//! When the `tracing` feature is enabled, span context is propagated to metrics labels.
//!
//! # Usage
//!
//! ```rust,ignore
//! use wsgate_metrics::{counter, gauge, histogram, websocket};
//!
//! counter!(websocket::TOTAL_CONNECTIONS).increment(1);
//! gauge!(websocket::ACTIVE_CONNECTIONS).increment(1.0);
//! histogram!(websocket::MESSAGE_LATENCY_SECONDS).record(0.004);
//! ```
//!
//! # Features
//!
//! - `prometheus`: Enable Prometheus metrics export via `/metrics` endpoint
//! - `tracing`: Enable tracing span context propagation to metrics labels

mod definitions;
mod recorder;
pub mod tracing_integration;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
