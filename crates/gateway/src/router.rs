//! Router: dispatches an inbound application message from an authenticated
//! (or still-unauthenticated) session to its recipients, and fans
//! user/group-addressed messages out over the bus.

use std::sync::Arc;

use tracing::debug;
use wsgate_protocol::{
    ApplicationMessage, DirectMessage, GroupMessage, PresenceMessage, TypingMessage, error_codes,
};

use crate::{
    bus::{Bus, messages_channel, publish_with_retry, user_channel},
    registry::ConnectionRegistry,
    session::{error_frame, now_ms},
};

/// Identity of the session a message was received from, attached by the
/// caller once the session has authenticated.
pub struct SenderContext {
    pub client_id: u64,
    pub user_id: String,
}

pub struct RouterConfig {
    pub node_id: String,
    pub channel_prefix: String,
    pub deliver_to_self_session: bool,
    pub publish_retry_delays_ms: Vec<u64>,
}

/// Stateless dispatcher: holds only shared references to the registry and
/// bus, and the static routing configuration.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn Bus>,
    config: RouterConfig,
}

impl Router {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, bus: Arc<dyn Bus>, config: RouterConfig) -> Self {
        Self {
            registry,
            bus,
            config,
        }
    }

    /// Route a message from an authenticated session. Unauthenticated
    /// sessions must go through the auth path instead (only `auth`
    /// messages are accepted before authentication — see `upgrader.rs`).
    pub async fn dispatch(&self, sender: &SenderContext, message: ApplicationMessage) {
        match message {
            ApplicationMessage::Direct(direct) => self.route_direct(sender, direct).await,
            ApplicationMessage::Group(group) => self.route_group(sender, group).await,
            ApplicationMessage::Typing(typing) => self.route_typing(sender, typing).await,
            ApplicationMessage::Presence(presence) => self.route_presence(sender, presence).await,
            ApplicationMessage::Ack(ack) => self.route_local_only(sender, "ack", &ack),
            ApplicationMessage::Heartbeat(hb) => self.route_local_only(sender, "heartbeat", &hb),
            ApplicationMessage::Error(_) | ApplicationMessage::Auth(_) => {
                // Error frames are server -> client only; auth frames are
                // handled before a session reaches the router.
                debug!(client_id = sender.client_id, "router: ignoring non-routable message type");
            },
        }
    }

    async fn route_direct(&self, sender: &SenderContext, mut message: DirectMessage) {
        metrics::counter!(wsgate_metrics::websocket::MESSAGES_RECEIVED_TOTAL).increment(1);

        // §4.5(2): stamp the authenticated sender, ignoring anything the
        // client put in `from` itself.
        message.from = sender.user_id.clone();

        let recipients = self.registry.lookup_user(&message.to_user_id).await;
        let mut delivered_locally = false;
        for recipient in &recipients {
            if !self.config.deliver_to_self_session
                && recipient.client_id == sender.client_id
            {
                continue;
            }
            let frame = serde_json::to_string(&ApplicationMessage::Direct(message.clone()))
                .unwrap_or_default();
            if recipient.try_send_frame(frame) {
                delivered_locally = true;
                metrics::counter!(wsgate_metrics::websocket::MESSAGES_SENT_TOTAL).increment(1);
            }
        }
        debug!(
            to_user_id = %message.to_user_id,
            delivered_locally,
            "router: direct message routed"
        );

        // Always publish, even if delivered locally — the recipient may
        // also have sessions on other nodes.
        let channel = user_channel(&self.config.channel_prefix, &message.to_user_id);
        let payload = serde_json::to_value(&ApplicationMessage::Direct(message)).unwrap_or_default();
        let _ = publish_with_retry(
            self.bus.as_ref(),
            &channel,
            &self.config.node_id,
            payload,
            &self.config.publish_retry_delays_ms,
        )
        .await;
    }

    async fn route_group(&self, sender: &SenderContext, mut message: GroupMessage) {
        metrics::counter!(wsgate_metrics::websocket::MESSAGES_RECEIVED_TOTAL).increment(1);
        message.from = sender.user_id.clone();

        // Group membership resolution is left to the application layer
        // subscribed on the group's bus channel; the gateway only fans the
        // message out to the shared topic.
        let channel = messages_channel(&self.config.channel_prefix);
        let payload = serde_json::to_value(&ApplicationMessage::Group(message)).unwrap_or_default();
        let _ = publish_with_retry(
            self.bus.as_ref(),
            &channel,
            &self.config.node_id,
            payload,
            &self.config.publish_retry_delays_ms,
        )
        .await;
    }

    async fn route_typing(&self, sender: &SenderContext, mut message: TypingMessage) {
        message.from = sender.user_id.clone();
        let recipients = self.registry.lookup_user(&message.to_user_id).await;
        for recipient in &recipients {
            if !self.config.deliver_to_self_session && recipient.client_id == sender.client_id {
                continue;
            }
            let frame = serde_json::to_string(&ApplicationMessage::Typing(message.clone()))
                .unwrap_or_default();
            // Best-effort: drop silently on a full queue, no slow-drop bookkeeping.
            let _ = recipient.try_send_frame(frame);
        }
    }

    async fn route_presence(&self, sender: &SenderContext, message: PresenceMessage) {
        let channel = messages_channel(&self.config.channel_prefix);
        let payload = serde_json::json!({
            "user_id": sender.user_id,
            "status": message.status,
            "timestamp": message.timestamp,
        });
        let _ = publish_with_retry(
            self.bus.as_ref(),
            &channel,
            &self.config.node_id,
            payload,
            &self.config.publish_retry_delays_ms,
        )
        .await;
    }

    fn route_local_only(&self, sender: &SenderContext, kind: &'static str, _message: &impl std::fmt::Debug) {
        debug!(client_id = sender.client_id, kind, "router: local-only message handled");
    }

    /// Deliver an envelope payload received from the bus to local sessions.
    pub async fn deliver_from_bus(&self, payload: serde_json::Value) {
        let Ok(message) = serde_json::from_value::<ApplicationMessage>(payload) else {
            return;
        };
        match message {
            ApplicationMessage::Direct(direct) => {
                for recipient in self.registry.lookup_user(&direct.to_user_id).await {
                    let frame = serde_json::to_string(&ApplicationMessage::Direct(direct.clone()))
                        .unwrap_or_default();
                    if recipient.try_send_frame(frame) {
                        metrics::counter!(wsgate_metrics::websocket::MESSAGES_SENT_TOTAL).increment(1);
                    }
                }
            },
            ApplicationMessage::Group(_) => {
                // Group fan-out from the bus requires membership resolution
                // that lives outside the gateway; nothing to do locally here
                // beyond what a membership-aware layer subscribes for.
            },
            _ => {},
        }
    }
}

/// Build the error frame a session sends when it attempts anything other
/// than `auth` before authenticating.
#[must_use]
pub fn auth_required_frame(message_id: &str) -> String {
    error_frame(message_id, error_codes::AUTH_REQUIRED, "authenticate first")
}

#[must_use]
pub fn unknown_type_frame(message_id: &str, detail: impl Into<String>) -> String {
    error_frame(message_id, error_codes::UNKNOWN_TYPE, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    fn router() -> Router {
        Router::new(
            Arc::new(ConnectionRegistry::new(4)),
            Arc::new(InMemoryBus::new()),
            RouterConfig {
                node_id: "node-a".into(),
                channel_prefix: "gateway".into(),
                deliver_to_self_session: false,
                publish_retry_delays_ms: vec![10],
            },
        )
    }

    #[tokio::test]
    async fn direct_message_to_unknown_user_still_publishes() {
        let router = router();
        let sender = SenderContext {
            client_id: 1,
            user_id: "u1".into(),
        };
        router
            .dispatch(
                &sender,
                ApplicationMessage::Direct(DirectMessage {
                    message_id: "m1".into(),
                    timestamp: now_ms(),
                    from: String::new(),
                    to_user_id: "u2".into(),
                    body: serde_json::json!({"text": "hi"}),
                }),
            )
            .await;
        // No panic, no local recipient: publish still happens (verified via
        // InMemoryBus not erroring).
    }

    #[tokio::test]
    async fn direct_message_is_stamped_with_authenticated_sender_not_client_supplied_from() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let recipient = Arc::new(crate::registry::ConnectionHandle {
            client_id: 2,
            remote_ip: "127.0.0.1".into(),
            user_id: std::sync::OnceLock::new(),
            device_id: std::sync::OnceLock::new(),
            authenticated: std::sync::atomic::AtomicBool::new(false),
            connected_at_ms: 0,
            last_activity_ms: Arc::new(std::sync::atomic::AtomicI64::new(0)),
            outbound: tx,
        });
        registry.add(Arc::clone(&recipient)).await;
        registry.register_authenticated(2, "u2".into(), Some("d1")).await;

        let router = Router::new(
            Arc::clone(&registry),
            Arc::new(InMemoryBus::new()),
            RouterConfig {
                node_id: "node-a".into(),
                channel_prefix: "gateway".into(),
                deliver_to_self_session: false,
                publish_retry_delays_ms: vec![10],
            },
        );
        let sender = SenderContext {
            client_id: 1,
            user_id: "u1".into(),
        };
        router
            .dispatch(
                &sender,
                ApplicationMessage::Direct(DirectMessage {
                    message_id: "m1".into(),
                    timestamp: now_ms(),
                    from: "u2-forged".into(),
                    to_user_id: "u2".into(),
                    body: serde_json::json!({"text": "hi"}),
                }),
            )
            .await;

        let Some(crate::registry::OutboundItem::Frame(frame)) = rx.recv().await else {
            panic!("expected a frame to be delivered locally");
        };
        assert!(frame.contains("\"from\":\"u1\""));
        assert!(!frame.contains("u2-forged"));
    }
}
