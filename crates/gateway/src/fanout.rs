//! Bus fan-out: keeps this node subscribed to the channels it needs to
//! receive cross-node traffic on. The shared `messages` channel is
//! subscribed once at startup; per-user channels are subscribed lazily,
//! the first time a user authenticates locally, and never torn down (a
//! user reconnecting to the same node reuses the existing subscription).

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    bus::{Bus, messages_channel, run_subscription, user_channel},
    router::Router,
};

pub struct BusFanout {
    bus: Arc<dyn Bus>,
    node_id: String,
    channel_prefix: String,
    handler_deadline: Duration,
    shutdown: CancellationToken,
    subscribed_users: Mutex<HashSet<String>>,
}

impl BusFanout {
    #[must_use]
    pub fn new(
        bus: Arc<dyn Bus>,
        node_id: String,
        channel_prefix: String,
        handler_deadline: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            node_id,
            channel_prefix,
            handler_deadline,
            shutdown,
            subscribed_users: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe to the shared broadcast/group channel. Call once, at
    /// startup, before accepting connections.
    pub fn start_broadcast_subscription(self: &Arc<Self>, router: Arc<Router>) {
        let bus = Arc::clone(&self.bus);
        let channel = messages_channel(&self.channel_prefix);
        let node_id = self.node_id.clone();
        let deadline = self.handler_deadline;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_subscription(bus, channel, node_id, deadline, move |payload| {
                let router = Arc::clone(&router);
                async move { router.deliver_from_bus(payload).await }
            }, shutdown)
            .await;
        });
    }

    /// Lazily subscribe to `user_id`'s direct-message channel the first
    /// time that user authenticates on this node. A no-op on repeat calls.
    pub async fn ensure_user_subscription(&self, user_id: String, router: Arc<Router>) {
        {
            let mut seen = self.subscribed_users.lock().await;
            if !seen.insert(user_id.clone()) {
                return;
            }
        }
        debug!(user_id = %user_id, "fanout: subscribing to user channel");

        let bus = Arc::clone(&self.bus);
        let channel = user_channel(&self.channel_prefix, &user_id);
        let node_id = self.node_id.clone();
        let deadline = self.handler_deadline;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_subscription(bus, channel, node_id, deadline, move |payload| {
                let router = Arc::clone(&router);
                async move { router.deliver_from_bus(payload).await }
            }, shutdown)
            .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::InMemoryBus, registry::ConnectionRegistry, router::RouterConfig};

    fn router() -> Arc<Router> {
        Arc::new(Router::new(
            Arc::new(ConnectionRegistry::new(4)),
            Arc::new(InMemoryBus::new()),
            RouterConfig {
                node_id: "node-a".into(),
                channel_prefix: "gateway".into(),
                deliver_to_self_session: false,
                publish_retry_delays_ms: vec![10],
            },
        ))
    }

    #[tokio::test]
    async fn ensure_user_subscription_is_idempotent() {
        let fanout = Arc::new(BusFanout::new(
            Arc::new(InMemoryBus::new()),
            "node-a".into(),
            "gateway".into(),
            Duration::from_millis(100),
            CancellationToken::new(),
        ));
        fanout.ensure_user_subscription("u1".into(), router()).await;
        fanout.ensure_user_subscription("u1".into(), router()).await;
        assert_eq!(fanout.subscribed_users.lock().await.len(), 1);
    }
}
