//! Exercises the scenario that motivates the bus adapter: two nodes sharing
//! one message bus, where a direct message sent on node A reaches a
//! recipient connected only to node B (and never echoes back onto A's own
//! subscription).

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use wsgate_gateway::{
    bus::InMemoryBus,
    fanout::BusFanout,
    registry::{ConnectionHandle, ConnectionRegistry, OutboundItem},
    router::{Router, RouterConfig, SenderContext},
};
use wsgate_protocol::{ApplicationMessage, DirectMessage};

fn make_handle(client_id: u64) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundItem>) {
    let (tx, rx) = mpsc::channel(8);
    (
        Arc::new(ConnectionHandle {
            client_id,
            remote_ip: "127.0.0.1".into(),
            user_id: std::sync::OnceLock::new(),
            device_id: std::sync::OnceLock::new(),
            authenticated: std::sync::atomic::AtomicBool::new(false),
            connected_at_ms: 0,
            last_activity_ms: Arc::new(std::sync::atomic::AtomicI64::new(0)),
            outbound: tx,
        }),
        rx,
    )
}

fn router(node_id: &str, registry: Arc<ConnectionRegistry>, bus: Arc<InMemoryBus>) -> Arc<Router> {
    Arc::new(Router::new(
        registry,
        bus,
        RouterConfig {
            node_id: node_id.into(),
            channel_prefix: "gateway".into(),
            deliver_to_self_session: false,
            publish_retry_delays_ms: vec![10],
        },
    ))
}

#[tokio::test]
async fn direct_message_crosses_nodes_without_echo() {
    let bus = Arc::new(InMemoryBus::new());

    let registry_a = Arc::new(ConnectionRegistry::new(4));
    let registry_b = Arc::new(ConnectionRegistry::new(4));

    let router_a = router("node-a", Arc::clone(&registry_a), Arc::clone(&bus));
    let router_b = router("node-b", Arc::clone(&registry_b), Arc::clone(&bus));

    let fanout_a = Arc::new(BusFanout::new(
        bus.clone(),
        "node-a".into(),
        "gateway".into(),
        Duration::from_secs(1),
        tokio_util::sync::CancellationToken::new(),
    ));
    let fanout_b = Arc::new(BusFanout::new(
        bus.clone(),
        "node-b".into(),
        "gateway".into(),
        Duration::from_secs(1),
        tokio_util::sync::CancellationToken::new(),
    ));

    // u1 is connected to node A, u2 is connected to node B.
    let (h1, mut rx1) = make_handle(1);
    registry_a.add(Arc::clone(&h1)).await;
    registry_a.register_authenticated(1, "u1".into(), Some("d1")).await;

    let (h2, mut rx2) = make_handle(2);
    registry_b.add(Arc::clone(&h2)).await;
    registry_b.register_authenticated(2, "u2".into(), Some("d1")).await;

    fanout_a.ensure_user_subscription("u1".into(), Arc::clone(&router_a)).await;
    fanout_b.ensure_user_subscription("u2".into(), Arc::clone(&router_b)).await;

    // Give the subscription tasks a moment to start listening.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sender = SenderContext {
        client_id: 1,
        user_id: "u1".into(),
    };
    router_a
        .dispatch(
            &sender,
            ApplicationMessage::Direct(DirectMessage {
                message_id: "m1".into(),
                timestamp: 0,
                from: "u2".into(), // client-supplied forgery; the router must overwrite this
                to_user_id: "u2".into(),
                body: serde_json::json!({"text": "hello from a"}),
            }),
        )
        .await;

    // u2, on node B, receives it via the bus.
    let delivered = tokio::time::timeout(Duration::from_secs(2), rx2.recv()).await;
    let Ok(Some(OutboundItem::Frame(frame))) = delivered else {
        panic!("expected node B to deliver the direct message to u2");
    };
    assert!(frame.contains("hello from a"));
    // §4.5(2)/§8 scenario 4: the delivered frame carries the authenticated
    // sender's user-id, not the client-supplied (forged) `from`.
    assert!(frame.contains("\"from\":\"u1\""));

    // u1 (the sender's own user) gets nothing out of this exchange: not a
    // recipient locally, and node A's own bus subscription on this same
    // message is loop-suppressed rather than re-delivered.
    assert!(tokio::time::timeout(Duration::from_millis(200), rx1.recv()).await.is_err());
}
