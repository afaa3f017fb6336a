use std::sync::Arc;
use std::time::Duration;

use fleetcast_core::{ConnectionConfig, HubConfig, PusherConfig};
use fleetcast_hub::{
    channel_transport, ChannelPeer, ConnState, Connection, Frame, Hub, IndexSync, Pusher,
    SubscriptionIndex,
};
use fleetcast_protocol::{Message, MessageType};
use serde_json::json;

struct Stack {
    hub: Hub,
    index: Arc<SubscriptionIndex>,
    pusher: Pusher,
}

impl Stack {
    fn start(max_connections: usize) -> Self {
        let index = Arc::new(SubscriptionIndex::new());
        let hub = Hub::new(
            HubConfig {
                max_connections,
                ..Default::default()
            },
            Arc::new(IndexSync::new(index.clone())),
        );
        let pusher = Pusher::new(
            hub.clone(),
            index.clone(),
            PusherConfig {
                worker_count: 4,
                queue_size: 64,
            },
        );
        hub.start();
        pusher.start();
        Self { hub, index, pusher }
    }

    /// Register and start a connection, returning it with its client end.
    async fn connect(&self, id: &str) -> (Arc<Connection>, ChannelPeer) {
        let (source, sink, peer) = channel_transport(16);
        let conn = Connection::new(id, "SN-1", "user-1", source, sink, ConnectionConfig::default());
        self.hub.register(conn.clone());
        conn.start(self.hub.clone());
        let hub = self.hub.clone();
        let id = id.to_string();
        wait_for(move || hub.get_client(&id).is_some()).await;
        (conn, peer)
    }

    async fn shutdown(self) {
        self.pusher.stop().await;
        self.hub.stop().await;
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

async fn next_message(peer: &mut ChannelPeer) -> Message {
    tokio::time::timeout(Duration::from_secs(1), peer.recv_message())
        .await
        .expect("timed out waiting for message")
        .expect("peer stream ended")
}

async fn assert_silent(peer: &mut ChannelPeer) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(frame) = peer.try_recv() {
        assert!(
            !matches!(frame, Frame::Text(_)),
            "unexpected message: {frame:?}"
        );
    }
}

async fn subscribe(peer: &mut ChannelPeer, stack: &Stack, id: &str, topic: &str) {
    peer.send_message(&Message::subscribe(topic)).await.unwrap();
    assert_eq!(next_message(peer).await, Message::ack(topic));
    let index = stack.index.clone();
    let (id, topic) = (id.to_string(), topic.to_string());
    wait_for(move || index.is_subscribed(&id, &topic)).await;
}

#[tokio::test]
async fn topic_push_reaches_subscriber_only() {
    let stack = Stack::start(100);
    let (_c1, mut p1) = stack.connect("C1").await;
    let (_c2, mut p2) = stack.connect("C2").await;
    subscribe(&mut p1, &stack, "C1", "device.telemetry").await;

    let msg = Message::event("device.telemetry", json!({"lat": 31.2, "lng": 121.5}));
    assert!(stack.pusher.push_to_topic("device.telemetry", msg.clone()));

    assert_eq!(next_message(&mut p1).await, msg);
    assert_silent(&mut p1).await;
    assert_silent(&mut p2).await;
    stack.shutdown().await;
}

#[tokio::test]
async fn topic_push_fans_out_to_every_subscriber() {
    let stack = Stack::start(100);
    let mut peers = Vec::new();
    for id in ["A", "B", "C"] {
        let (_conn, mut peer) = stack.connect(id).await;
        subscribe(&mut peer, &stack, id, "topic1").await;
        peers.push(peer);
    }
    let (_d, mut outsider) = stack.connect("D").await;

    let msg = Message::event("topic1", json!({"seq": 1}));
    assert!(stack.pusher.push_to_topic("topic1", msg.clone()));

    for peer in &mut peers {
        assert_eq!(next_message(peer).await, msg);
    }
    assert_silent(&mut outsider).await;
    assert_eq!(stack.index.subscriber_count("topic1"), 3);
    stack.shutdown().await;
}

#[tokio::test]
async fn subscribe_is_acked_and_indexed() {
    let stack = Stack::start(100);
    let (conn, mut peer) = stack.connect("C1").await;

    peer.send_message(&Message::subscribe("t").with_trace_id("tr-9"))
        .await
        .unwrap();
    let reply = next_message(&mut peer).await;
    assert_eq!(reply.msg_type, MessageType::Ack);
    assert_eq!(reply.event, "t");
    assert_eq!(reply.trace_id, "tr-9");
    assert!(conn.is_subscribed("t"));

    let index = stack.index.clone();
    wait_for(move || index.is_subscribed("C1", "t")).await;
    stack.shutdown().await;
}

#[tokio::test]
async fn pattern_push_and_exclusions() {
    let stack = Stack::start(100);
    let (_a, mut pa) = stack.connect("A").await;
    let (_b, mut pb) = stack.connect("B").await;
    subscribe(&mut pa, &stack, "A", "device.drone1.osd").await;
    subscribe(&mut pb, &stack, "B", "device.dock1.osd").await;

    assert!(stack.pusher.push_to_pattern("device.*.osd", Message::event("osd", json!(1))));
    assert_eq!(next_message(&mut pa).await.event, "osd");
    assert_eq!(next_message(&mut pb).await.event, "osd");

    assert!(stack.pusher.push_to_topic_excluding(
        "device.dock1.osd",
        Message::event("osd", json!(2)),
        vec!["B".into()],
    ));
    assert_silent(&mut pb).await;
    stack.shutdown().await;
}

#[tokio::test]
async fn disconnect_clears_registry_and_index() {
    let stack = Stack::start(100);
    let (conn, mut peer) = stack.connect("C1").await;
    subscribe(&mut peer, &stack, "C1", "device.status").await;

    peer.disconnect();
    let c = conn.clone();
    wait_for(move || c.state() == ConnState::Closed).await;
    let hub = stack.hub.clone();
    wait_for(move || hub.get_client("C1").is_none()).await;
    let index = stack.index.clone();
    wait_for(move || index.topics("C1").is_empty()).await;
    assert_eq!(stack.index.subscriber_count("device.status"), 0);
    stack.shutdown().await;
}

#[tokio::test]
async fn capacity_limit_closes_the_extra_connection() {
    let stack = Stack::start(1);
    let (_first, _p1) = stack.connect("first").await;

    let (source, sink, _p2) = channel_transport(4);
    let extra = Connection::new("extra", "", "", source, sink, ConnectionConfig::default());
    stack.hub.register(extra.clone());
    let e = extra.clone();
    wait_for(move || e.is_closed()).await;

    assert_eq!(stack.hub.client_count(), 1);
    assert_eq!(stack.hub.stats().rejected, 1);
    extra.close();
    stack.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let stack = Stack::start(100);
    let (_a, mut pa) = stack.connect("A").await;
    let (_b, mut pb) = stack.connect("B").await;

    let msg = Message::event("notice", json!("maintenance"));
    assert!(stack.pusher.broadcast(msg.clone()));
    assert_eq!(next_message(&mut pa).await, msg);
    assert_eq!(next_message(&mut pb).await, msg);
    stack.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let stack = Stack::start(100);
    let (conn, mut peer) = stack.connect("C1").await;
    let hub = stack.hub.clone();
    stack.shutdown().await;

    assert!(conn.is_closed());
    assert_eq!(hub.client_count(), 0);
    // The sink is closed after a final close frame, ending the peer stream.
    let mut frames = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(frame) = peer.recv().await {
            frames.push(frame);
        }
    })
    .await
    .expect("peer stream did not end");
    assert_eq!(frames.last(), Some(&Frame::Close));
}
