//! Bus adapter: publishes outbound fan-out to other nodes and subscribes to
//! inbound fan-out from them, wrapping payloads in an `Envelope` so the
//! receiving node can suppress its own echoes.
//!
//! The `Bus` trait is the seam a real deployment plugs a message broker
//! into (Redis, NATS, a Kafka topic); `InMemoryBus` is a same-process
//! loopback implementation used for single-node deployments and tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use wsgate_protocol::Envelope;

use crate::error::BusError;

/// Minimal pub/sub seam the gateway needs from a message bus.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, BusError>;
}

/// Same-process loopback bus: every subscriber to a channel receives every
/// publish to that channel. Useful for single-node deployments and for
/// exercising the adapter's envelope/loop-suppression logic in tests
/// without standing up a real broker.
pub struct InMemoryBus {
    channels: dashmap::DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: dashmap::DashMap::new(),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // No subscribers yet is not an error; the message is simply dropped,
        // matching the semantics of a real pub/sub broker.
        let _ = self.sender_for(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, BusError> {
        let rx = self.sender_for(channel).subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }
}

/// Channel name for the general fan-out topic, e.g. for group messages.
#[must_use]
pub fn messages_channel(prefix: &str) -> String {
    format!("{prefix}:messages")
}

/// Channel name for a specific user's direct-message fan-out.
#[must_use]
pub fn user_channel(prefix: &str, user_id: &str) -> String {
    format!("{prefix}:user:{user_id}")
}

/// Wraps `payload` in an envelope stamped with this node's id and publishes
/// it, retrying transient failures with the configured backoff schedule.
pub async fn publish_with_retry(
    bus: &dyn Bus,
    channel: &str,
    node_id: &str,
    payload: serde_json::Value,
    retry_delays_ms: &[u64],
) -> Result<(), BusError> {
    let envelope = Envelope::new(node_id, crate::session::now_ms(), payload);
    let bytes = serde_json::to_vec(&envelope)
        .map_err(|e| BusError::PublishFailed(format!("serialize envelope: {e}")))?;

    let mut attempt = 0;
    loop {
        match bus.publish(channel, bytes.clone()).await {
            Ok(()) => {
                metrics::counter!(wsgate_metrics::bus::PUBLISHED_TOTAL).increment(1);
                return Ok(());
            },
            Err(e) if attempt < retry_delays_ms.len() => {
                metrics::counter!(wsgate_metrics::bus::PUBLISH_FAILURES_TOTAL).increment(1);
                warn!(channel, attempt, error = %e, "bus publish failed, retrying");
                tokio::time::sleep(Duration::from_millis(retry_delays_ms[attempt])).await;
                attempt += 1;
            },
            Err(e) => {
                metrics::counter!(wsgate_metrics::bus::PUBLISH_FAILURES_TOTAL).increment(1);
                return Err(e);
            },
        }
    }
}

/// Runs a subscription loop against `channel`, calling `handler` for every
/// envelope received whose origin isn't this node. Reconnects with
/// exponential backoff and jitter on subscribe errors. Each handler
/// invocation is bounded by `handler_deadline`.
pub async fn run_subscription<F, Fut>(
    bus: Arc<dyn Bus>,
    channel: String,
    local_node_id: String,
    handler_deadline: Duration,
    mut handler: F,
    shutdown: tokio_util::sync::CancellationToken,
) where
    F: FnMut(serde_json::Value) -> Fut + Send,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut backoff_ms = 100_u64;
    const MAX_BACKOFF_MS: u64 = 10_000;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let mut stream = match bus.subscribe(&channel).await {
            Ok(s) => s,
            Err(e) => {
                warn!(channel = %channel, error = %e, backoff_ms, "bus subscribe failed, reconnecting");
                metrics::counter!(wsgate_metrics::bus::RECONNECTS_TOTAL).increment(1);
                let jitter_ms = (backoff_ms as f64 * jitter_fraction()) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)) => {}
                    () = shutdown.cancelled() => return,
                }
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                continue;
            },
        };
        backoff_ms = 100;

        loop {
            let next = tokio::select! {
                item = stream.next() => item,
                () = shutdown.cancelled() => return,
            };
            let Some(bytes) = next else {
                debug!(channel = %channel, "bus subscription stream ended, reconnecting");
                break;
            };

            let envelope: Envelope = match serde_json::from_slice(&bytes) {
                Ok(e) => e,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "bus: dropping undecodable envelope");
                    continue;
                },
            };

            if envelope.originated_locally(&local_node_id) {
                metrics::counter!(wsgate_metrics::bus::LOOP_SUPPRESSED_TOTAL).increment(1);
                continue;
            }

            metrics::counter!(wsgate_metrics::bus::RECEIVED_TOTAL).increment(1);
            if tokio::time::timeout(handler_deadline, handler(envelope.payload))
                .await
                .is_err()
            {
                metrics::counter!(wsgate_metrics::bus::HANDLER_TIMEOUTS_TOTAL).increment(1);
                warn!(channel = %channel, "bus handler exceeded deadline");
            }
        }
    }
}

fn jitter_fraction() -> f64 {
    (rand::random::<u32>() % 1000) as f64 / 1000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_bus_delivers_published_payload_to_subscriber() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("test:channel").await.unwrap();
        bus.publish("test:channel", b"hello".to_vec()).await.unwrap();
        let received = stream.next().await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn envelope_from_own_node_is_suppressed() {
        let envelope = Envelope::new("node-a", 0, serde_json::json!({"x": 1}));
        assert!(envelope.originated_locally("node-a"));
        assert!(!envelope.originated_locally("node-b"));
    }

    #[tokio::test]
    async fn publish_with_retry_succeeds_on_healthy_bus() {
        let bus = InMemoryBus::new();
        let result = publish_with_retry(
            &bus,
            "test:channel",
            "node-a",
            serde_json::json!({}),
            &[100, 500, 2000],
        )
        .await;
        assert!(result.is_ok());
    }
}
