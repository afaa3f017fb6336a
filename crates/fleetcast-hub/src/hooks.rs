use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fleetcast_protocol::{Message, MessageType};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::subscription::SubscriptionIndex;

/// Observer for connection lifecycle and inbound traffic.
///
/// Registered once on the [`Hub`](crate::Hub). Calls are made from a dedicated
/// hook task, never from the control loop or a connection loop, so a slow hook
/// only delays other hooks. Handlers should still be cheap and non-blocking.
pub trait HubHooks: Send + Sync {
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    fn on_disconnect(&self, _conn: &Arc<Connection>) {}

    /// Every inbound message except `ping`, after the connection has applied
    /// its own subscribe/unsubscribe bookkeeping.
    fn on_message(&self, _conn: &Arc<Connection>, _msg: &Message) {}
}

/// Hooks that do nothing.
pub struct NoopHooks;

impl HubHooks for NoopHooks {}

/// Keeps a [`SubscriptionIndex`] in step with the subscribe/unsubscribe
/// messages clients send, and drops a client's index entries when it leaves.
pub struct IndexSync {
    index: Arc<SubscriptionIndex>,
}

impl IndexSync {
    pub fn new(index: Arc<SubscriptionIndex>) -> Self {
        Self { index }
    }
}

impl HubHooks for IndexSync {
    fn on_connect(&self, conn: &Arc<Connection>) {
        info!(
            conn_id = %conn.id(),
            device_sn = %conn.device_sn(),
            user_id = %conn.user_id(),
            "client connected"
        );
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        self.index.unsubscribe_all(conn.id());
        info!(conn_id = %conn.id(), "client disconnected");
    }

    fn on_message(&self, conn: &Arc<Connection>, msg: &Message) {
        match msg.msg_type {
            MessageType::Subscribe if !msg.event.is_empty() => {
                self.index.subscribe(conn.id(), &msg.event);
            }
            MessageType::Unsubscribe if !msg.event.is_empty() => {
                self.index.unsubscribe(conn.id(), &msg.event);
            }
            _ => {}
        }
    }
}

pub(crate) enum HookEvent {
    Connect(Arc<Connection>),
    Disconnect(Arc<Connection>),
    Message(Arc<Connection>, Message),
}

impl HookEvent {
    fn kind(&self) -> &'static str {
        match self {
            HookEvent::Connect(_) => "on_connect",
            HookEvent::Disconnect(_) => "on_disconnect",
            HookEvent::Message(..) => "on_message",
        }
    }
}

/// Single-task, bounded queue in front of the user's [`HubHooks`].
///
/// One task keeps hook calls in emission order (a client's connect is always
/// observed before its messages and its disconnect). Overflow drops the event.
pub(crate) struct HookRunner {
    hooks: Arc<dyn HubHooks>,
    tx: mpsc::Sender<HookEvent>,
    rx: Arc<Mutex<mpsc::Receiver<HookEvent>>>,
    dropped: AtomicU64,
}

impl HookRunner {
    pub(crate) fn new(hooks: Arc<dyn HubHooks>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            hooks,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn emit(&self, event: HookEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let event = match e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            warn!(hook = event.kind(), "hook queue full, event dropped");
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Start the hook task. On cancellation it drains whatever is already
    /// queued before exiting, so disconnects emitted during shutdown still run.
    pub(crate) fn spawn(&self, token: CancellationToken) -> JoinHandle<()> {
        let hooks = Arc::clone(&self.hooks);
        let rx = Arc::clone(&self.rx);
        tokio::spawn(async move {
            let mut rx = rx.lock().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => dispatch(hooks.as_ref(), event),
                        None => return,
                    },
                }
            }
            while let Ok(event) = rx.try_recv() {
                dispatch(hooks.as_ref(), event);
            }
        })
    }
}

fn dispatch(hooks: &dyn HubHooks, event: HookEvent) {
    let kind = event.kind();
    let t = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
        HookEvent::Connect(conn) => hooks.on_connect(conn),
        HookEvent::Disconnect(conn) => hooks.on_disconnect(conn),
        HookEvent::Message(conn, msg) => hooks.on_message(conn, msg),
    }));
    let elapsed_ms = t.elapsed().as_millis() as u64;

    if outcome.is_err() {
        error!(hook = kind, duration_ms = elapsed_ms, "hook panicked, event skipped");
    } else {
        debug!(hook = kind, duration_ms = elapsed_ms, "hook completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcast_core::ConnectionConfig;
    use std::sync::Mutex as StdMutex;

    use crate::transport::channel_transport;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<String>>,
    }

    impl HubHooks for Recorder {
        fn on_connect(&self, conn: &Arc<Connection>) {
            self.seen.lock().unwrap().push(format!("connect:{}", conn.id()));
        }

        fn on_disconnect(&self, conn: &Arc<Connection>) {
            self.seen.lock().unwrap().push(format!("disconnect:{}", conn.id()));
        }

        fn on_message(&self, _conn: &Arc<Connection>, msg: &Message) {
            if msg.event == "boom" {
                panic!("hook failure");
            }
            self.seen.lock().unwrap().push(format!("message:{}", msg.event));
        }
    }

    fn conn(id: &str) -> Arc<Connection> {
        let (source, sink, _peer) = channel_transport(4);
        Connection::new(id, "", "", source, sink, ConnectionConfig::default())
    }

    #[tokio::test]
    async fn events_run_in_order_and_survive_panics() {
        let recorder = Arc::new(Recorder::default());
        let runner = HookRunner::new(recorder.clone(), 16);
        let c = conn("c1");

        runner.emit(HookEvent::Connect(c.clone()));
        runner.emit(HookEvent::Message(c.clone(), Message::subscribe("boom")));
        runner.emit(HookEvent::Message(c.clone(), Message::subscribe("t")));
        runner.emit(HookEvent::Disconnect(c.clone()));

        let token = CancellationToken::new();
        let handle = runner.spawn(token.clone());
        token.cancel();
        handle.await.unwrap();

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["connect:c1", "message:t", "disconnect:c1"]);
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let runner = HookRunner::new(Arc::new(NoopHooks), 1);
        let c = conn("c1");
        runner.emit(HookEvent::Connect(c.clone()));
        runner.emit(HookEvent::Disconnect(c));
        assert_eq!(runner.dropped(), 1);
    }

    #[tokio::test]
    async fn index_sync_mirrors_subscriptions() {
        let index = Arc::new(SubscriptionIndex::new());
        let sync = IndexSync::new(index.clone());
        let c = conn("c1");

        sync.on_message(&c, &Message::subscribe("device.status"));
        sync.on_message(&c, &Message::subscribe(""));
        assert!(index.is_subscribed("c1", "device.status"));
        assert_eq!(index.topic_count(), 1);

        sync.on_message(&c, &Message::unsubscribe("device.status"));
        assert!(!index.is_subscribed("c1", "device.status"));

        sync.on_message(&c, &Message::subscribe("a"));
        sync.on_disconnect(&c);
        assert!(index.topics("c1").is_empty());
    }
}
