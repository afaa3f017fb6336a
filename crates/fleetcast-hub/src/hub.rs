use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fleetcast_core::HubConfig;
use fleetcast_protocol::Message;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::hooks::{HookEvent, HookRunner, HubHooks};

/// Counters exposed through [`Hub::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub clients: usize,
    pub accepted: u64,
    /// Registrations refused because the hub was at capacity or stopped.
    pub rejected: u64,
    /// Register/unregister/broadcast requests dropped on a full queue.
    pub dropped_requests: u64,
    /// Per-connection broadcast deliveries skipped on a full send queue.
    pub broadcast_skipped: u64,
    pub hooks_dropped: u64,
}

struct Queues {
    register: mpsc::Receiver<Arc<Connection>>,
    unregister: mpsc::Receiver<Arc<Connection>>,
    broadcast: mpsc::Receiver<Message>,
}

struct Running {
    token: CancellationToken,
    control: JoinHandle<()>,
    hooks_token: CancellationToken,
    hooks: JoinHandle<()>,
}

struct HubInner {
    config: HubConfig,
    clients: RwLock<HashMap<String, Arc<Connection>>>,
    register_tx: mpsc::Sender<Arc<Connection>>,
    unregister_tx: mpsc::Sender<Arc<Connection>>,
    broadcast_tx: mpsc::Sender<Message>,
    /// Held by the control loop for as long as it runs.
    queues: Arc<tokio::sync::Mutex<Queues>>,
    hooks: HookRunner,
    running: Mutex<Option<Running>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    dropped_requests: AtomicU64,
    broadcast_skipped: AtomicU64,
}

/// Registry of live connections.
///
/// Insertions and removals happen only on the control loop, fed by bounded
/// register/unregister/broadcast queues. Lookups and direct sends take the
/// read lock and never wait on the control loop. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig, hooks: Arc<dyn HubHooks>) -> Self {
        let queue_size = config.queue_size.max(1);
        let (register_tx, register) = mpsc::channel(queue_size);
        let (unregister_tx, unregister) = mpsc::channel(queue_size);
        let (broadcast_tx, broadcast) = mpsc::channel(queue_size);
        let hooks = HookRunner::new(hooks, config.hook_queue_size.max(1));

        Self {
            inner: Arc::new(HubInner {
                config,
                clients: RwLock::new(HashMap::new()),
                register_tx,
                unregister_tx,
                broadcast_tx,
                queues: Arc::new(tokio::sync::Mutex::new(Queues {
                    register,
                    unregister,
                    broadcast,
                })),
                hooks,
                running: Mutex::new(None),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                dropped_requests: AtomicU64::new(0),
                broadcast_skipped: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the control loop and the hook task. No-op when already running.
    pub fn start(&self) {
        let mut running = self.inner.running.lock().expect("hub lifecycle poisoned");
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let hooks_token = CancellationToken::new();
        let hooks = self.inner.hooks.spawn(hooks_token.clone());
        let control = tokio::spawn(self.clone().run(token.clone()));

        *running = Some(Running {
            token,
            control,
            hooks_token,
            hooks,
        });
        info!(max_connections = self.inner.config.max_connections, "hub started");
    }

    /// Stop the control loop, close every tracked connection and clear the
    /// registry. No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self
            .inner
            .running
            .lock()
            .expect("hub lifecycle poisoned")
            .take()
        else {
            return;
        };

        running.token.cancel();
        let _ = running.control.await;

        let drained: Vec<Arc<Connection>> = self
            .inner
            .clients
            .write()
            .expect("client registry poisoned")
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &drained {
            conn.close();
            self.inner.hooks.emit(HookEvent::Disconnect(Arc::clone(conn)));
        }

        // Let the hook task flush the disconnects before it exits.
        running.hooks_token.cancel();
        let _ = running.hooks.await;
        info!(closed = drained.len(), "hub stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .expect("hub lifecycle poisoned")
            .is_some()
    }

    /// Hand a connection to the control loop.
    ///
    /// If the hub is stopped or the register queue is full the connection is
    /// closed instead, so it never believes itself registered.
    pub fn register(&self, conn: Arc<Connection>) {
        // Checked under the lifecycle lock so `stop()` cannot land between the
        // check and the enqueue; the exiting control loop closes anything
        // enqueued before it.
        let running = self.inner.running.lock().expect("hub lifecycle poisoned");
        if running.is_none() {
            drop(running);
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(conn_id = %conn.id(), "hub not running, closing connection");
            conn.close();
            return;
        }
        let sent = self.inner.register_tx.try_send(conn);
        drop(running);

        if let Err(e) = sent {
            let conn = match e {
                TrySendError::Full(c) | TrySendError::Closed(c) => c,
            };
            self.inner.dropped_requests.fetch_add(1, Ordering::Relaxed);
            warn!(conn_id = %conn.id(), "register queue full, closing connection");
            conn.close();
        }
    }

    /// Ask the control loop to remove a connection.
    ///
    /// The connection is closed either way; if the queue is full its registry
    /// entry is reaped later by the control loop.
    pub fn unregister(&self, conn: &Arc<Connection>) {
        if !self.is_running() {
            // The registry is empty while stopped; nothing to remove.
            conn.close();
            return;
        }
        if self.inner.unregister_tx.try_send(Arc::clone(conn)).is_err() {
            self.inner.dropped_requests.fetch_add(1, Ordering::Relaxed);
            warn!(conn_id = %conn.id(), "unregister queue full, closing connection");
            conn.close();
        }
    }

    /// Queue `msg` for every registered connection. `false` when dropped.
    pub fn broadcast(&self, msg: Message) -> bool {
        match self.inner.broadcast_tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                self.inner.dropped_requests.fetch_add(1, Ordering::Relaxed);
                let msg = match e {
                    TrySendError::Full(m) | TrySendError::Closed(m) => m,
                };
                warn!(event = %msg.event, "broadcast queue full, message dropped");
                false
            }
        }
    }

    /// Enqueue directly on one connection. `false` if unknown or its queue is full.
    pub fn send_to_client(&self, id: &str, msg: Message) -> bool {
        match self.get_client(id) {
            Some(conn) => conn.send(msg),
            None => false,
        }
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner
            .clients
            .read()
            .expect("client registry poisoned")
            .get(id)
            .cloned()
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .clients
            .read()
            .expect("client registry poisoned")
            .len()
    }

    /// Snapshot of every registered connection.
    pub fn clients(&self) -> Vec<Arc<Connection>> {
        self.inner
            .clients
            .read()
            .expect("client registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            clients: self.client_count(),
            accepted: self.inner.accepted.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            dropped_requests: self.inner.dropped_requests.load(Ordering::Relaxed),
            broadcast_skipped: self.inner.broadcast_skipped.load(Ordering::Relaxed),
            hooks_dropped: self.inner.hooks.dropped(),
        }
    }

    pub(crate) fn notify_message(&self, conn: &Arc<Connection>, msg: Message) {
        self.inner
            .hooks
            .emit(HookEvent::Message(Arc::clone(conn), msg));
    }

    async fn run(self, token: CancellationToken) {
        let queues = Arc::clone(&self.inner.queues);
        let mut guard = queues.lock().await;
        // Reborrow once so the select arms borrow disjoint fields.
        let queues = &mut *guard;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(conn) = queues.register.recv() => self.handle_register(conn),
                Some(conn) = queues.unregister.recv() => self.handle_unregister(conn),
                Some(msg) = queues.broadcast.recv() => self.handle_broadcast(msg),
                else => break,
            }
        }

        // Requests still queued at shutdown: nothing will serve them.
        while let Ok(conn) = queues.register.try_recv() {
            conn.close();
        }
        while let Ok(conn) = queues.unregister.try_recv() {
            conn.close();
        }
        while queues.broadcast.try_recv().is_ok() {}
        debug!("hub control loop exited");
    }

    fn handle_register(&self, conn: Arc<Connection>) {
        if conn.is_closed() {
            debug!(conn_id = %conn.id(), "skipping registration of closed connection");
            return;
        }

        let max = self.inner.config.max_connections;
        let replaced = {
            let mut clients = self.inner.clients.write().expect("client registry poisoned");
            let at_capacity = !clients.contains_key(conn.id()) && clients.len() >= max;
            let reaped = if at_capacity { reap_closed(&mut clients) } else { Vec::new() };
            let still_full = !clients.contains_key(conn.id()) && clients.len() >= max;
            if still_full {
                drop(clients);
                self.emit_disconnects(reaped);
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(conn_id = %conn.id(), max_connections = max, "hub at capacity, rejecting connection");
                conn.close();
                return;
            }
            let replaced = clients.insert(conn.id().to_string(), Arc::clone(&conn));
            drop(clients);
            self.emit_disconnects(reaped);
            replaced
        };

        // A reconnect with the same id supersedes the old connection.
        if let Some(old) = replaced {
            info!(conn_id = %conn.id(), "replacing existing connection with same id");
            old.close();
            self.inner.hooks.emit(HookEvent::Disconnect(old));
        }

        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = %conn.id(), clients = self.client_count(), "connection registered");
        self.inner.hooks.emit(HookEvent::Connect(conn));
    }

    fn handle_unregister(&self, conn: Arc<Connection>) {
        let removed = {
            let mut clients = self.inner.clients.write().expect("client registry poisoned");
            // Only remove the entry if it is this exact connection, not a
            // newer one registered under the same id.
            match clients.get(conn.id()) {
                Some(current) if Arc::ptr_eq(current, &conn) => clients.remove(conn.id()),
                _ => None,
            }
        };
        conn.close();

        if let Some(conn) = removed {
            debug!(conn_id = %conn.id(), "connection unregistered");
            self.inner.hooks.emit(HookEvent::Disconnect(conn));
        }
    }

    fn handle_broadcast(&self, msg: Message) {
        let mut closed = false;
        let mut skipped = 0u64;
        {
            let clients = self.inner.clients.read().expect("client registry poisoned");
            for conn in clients.values() {
                if conn.is_closed() {
                    closed = true;
                } else if !conn.send(msg.clone()) {
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            self.inner.broadcast_skipped.fetch_add(skipped, Ordering::Relaxed);
            debug!(event = %msg.event, skipped, "broadcast skipped slow connections");
        }
        if closed {
            let reaped = reap_closed(&mut self.inner.clients.write().expect("client registry poisoned"));
            self.emit_disconnects(reaped);
        }
    }

    fn emit_disconnects(&self, conns: Vec<Arc<Connection>>) {
        for conn in conns {
            debug!(conn_id = %conn.id(), "reaped closed connection");
            self.inner.hooks.emit(HookEvent::Disconnect(conn));
        }
    }
}

/// Remove connections that closed without their unregister request arriving.
fn reap_closed(clients: &mut HashMap<String, Arc<Connection>>) -> Vec<Arc<Connection>> {
    let ids: Vec<String> = clients
        .iter()
        .filter(|(_, conn)| conn.is_closed())
        .map(|(id, _)| id.clone())
        .collect();
    ids.iter().filter_map(|id| clients.remove(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnState;
    use crate::hooks::NoopHooks;
    use crate::transport::channel_transport;
    use fleetcast_core::ConnectionConfig;
    use std::time::Duration;

    fn conn(id: &str) -> Arc<Connection> {
        let (source, sink, _peer) = channel_transport(4);
        Connection::new(id, "", "", source, sink, ConnectionConfig::default())
    }

    fn hub_with(max_connections: usize) -> Hub {
        let config = HubConfig {
            max_connections,
            ..Default::default()
        };
        Hub::new(config, Arc::new(NoopHooks))
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let hub = hub_with(10);
        hub.start();
        let c1 = conn("c1");
        hub.register(c1.clone());
        wait_for(|| hub.client_count() == 1).await;

        let found = hub.get_client("c1").unwrap();
        assert!(Arc::ptr_eq(&found, &c1));
        assert!(hub.get_client("nope").is_none());
        hub.stop().await;
    }

    #[tokio::test]
    async fn capacity_rejects_and_closes_extra_connection() {
        let hub = hub_with(3);
        hub.start();
        let conns: Vec<_> = (0..4).map(|i| conn(&format!("c{i}"))).collect();
        for c in &conns {
            hub.register(c.clone());
        }
        wait_for(|| hub.stats().accepted + hub.stats().rejected == 4).await;

        assert_eq!(hub.client_count(), 3);
        assert_eq!(hub.stats().rejected, 1);
        assert!(hub.get_client("c3").is_none());
        assert!(conns[3].is_closed());
        assert!(hub.clients().iter().all(|c| c.id() != "c3"));
        hub.stop().await;
    }

    #[tokio::test]
    async fn closed_entries_are_reaped_before_rejecting() {
        let hub = hub_with(1);
        hub.start();
        let stale = conn("stale");
        hub.register(stale.clone());
        wait_for(|| hub.client_count() == 1).await;

        // Closed without an unregister request reaching the hub.
        stale.close();
        let fresh = conn("fresh");
        hub.register(fresh.clone());
        wait_for(|| hub.get_client("fresh").is_some()).await;
        assert_eq!(hub.client_count(), 1);
        assert!(!fresh.is_closed());
        hub.stop().await;
    }

    #[tokio::test]
    async fn unregister_removes_and_closes() {
        let hub = hub_with(10);
        hub.start();
        let c1 = conn("c1");
        hub.register(c1.clone());
        wait_for(|| hub.client_count() == 1).await;

        hub.unregister(&c1);
        wait_for(|| hub.client_count() == 0).await;
        assert!(c1.is_closed());
        hub.stop().await;
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_connection() {
        let hub = hub_with(10);
        hub.start();
        let old = conn("dup");
        hub.register(old.clone());
        wait_for(|| hub.client_count() == 1).await;

        let new = conn("dup");
        hub.register(new.clone());
        wait_for(|| old.is_closed()).await;

        hub.unregister(&old);
        hub.broadcast(Message::ping());
        wait_for(|| hub.stats().accepted == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let current = hub.get_client("dup").unwrap();
        assert!(Arc::ptr_eq(&current, &new));
        hub.stop().await;
    }

    #[tokio::test]
    async fn send_to_client_direct() {
        let hub = hub_with(10);
        hub.start();
        let c1 = conn("c1");
        hub.register(c1.clone());
        wait_for(|| hub.client_count() == 1).await;

        assert!(hub.send_to_client("c1", Message::ping()));
        assert!(!hub.send_to_client("ghost", Message::ping()));
        assert_eq!(c1.drain_queue(), vec![Message::ping()]);
        hub.stop().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_all_and_skips_full_queues() {
        let hub = hub_with(10);
        hub.start();
        let small = {
            let (source, sink, _peer) = channel_transport(4);
            let cfg = ConnectionConfig {
                send_buffer_size: 1,
                ..Default::default()
            };
            Connection::new("small", "", "", source, sink, cfg)
        };
        let big = conn("big");
        hub.register(small.clone());
        hub.register(big.clone());
        wait_for(|| hub.client_count() == 2).await;

        assert!(hub.broadcast(Message::event("t", serde_json::json!(1))));
        assert!(hub.broadcast(Message::event("t", serde_json::json!(2))));
        wait_for(|| hub.stats().broadcast_skipped == 1).await;

        assert_eq!(big.drain_queue().len(), 2);
        assert_eq!(small.drain_queue().len(), 1);
        hub.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_everything_and_is_idempotent() {
        let hub = hub_with(10);
        hub.start();
        hub.start();
        assert!(hub.is_running());
        let c1 = conn("c1");
        let c2 = conn("c2");
        hub.register(c1.clone());
        hub.register(c2.clone());
        wait_for(|| hub.client_count() == 2).await;

        hub.stop().await;
        assert!(!hub.is_running());
        assert_eq!(hub.client_count(), 0);
        assert!(c1.is_closed() && c2.is_closed());
        hub.stop().await;
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let hub = hub_with(10);
        hub.start();
        hub.stop().await;
        hub.start();
        hub.register(conn("c1"));
        wait_for(|| hub.client_count() == 1).await;
        hub.stop().await;
    }

    #[tokio::test]
    async fn full_register_queue_closes_connection() {
        let config = HubConfig {
            queue_size: 1,
            ..Default::default()
        };
        let hub = Hub::new(config, Arc::new(NoopHooks));
        // Hold the queues so the control loop cannot drain them.
        let queues = Arc::clone(&hub.inner.queues);
        let guard = queues.lock().await;
        hub.start();

        let first = conn("first");
        let second = conn("second");
        hub.register(first.clone());
        hub.register(second.clone());
        assert!(!first.is_closed());
        assert!(second.is_closed());
        assert_eq!(hub.stats().dropped_requests, 1);

        drop(guard);
        wait_for(|| hub.client_count() == 1).await;
        hub.stop().await;
    }

    #[tokio::test]
    async fn register_while_stopped_closes_connection() {
        let hub = hub_with(10);
        let early = conn("early");
        hub.register(early.clone());
        assert!(early.is_closed());

        hub.start();
        hub.stop().await;
        let late = conn("late");
        hub.register(late.clone());
        late.start(hub.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(late.is_closed());
        assert_eq!(late.state(), ConnState::Closed);
        assert!(hub.get_client("late").is_none());
        assert_eq!(hub.stats().rejected, 2);
        assert_eq!(hub.stats().dropped_requests, 0);
    }
}
