//! One client connection: an outbound queue, a topic set and the two loops
//! that drive the transport.
//!
//! ```text
//!   Open ──close() / fatal transport error──▶ Closing ──both loops exited──▶ Closed
//! ```
//!
//! A connection that was never started goes straight to `Closed`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetcast_core::ConnectionConfig;
use fleetcast_protocol::{Message, MessageType};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::hub::Hub;
use crate::transport::{Frame, FrameSink, FrameSource};

/// Pending transport-level replies (pongs to peer pings).
const CONTROL_QUEUE_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closing,
    Closed,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Open,
            1 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

type Halves = (Box<dyn FrameSource>, Box<dyn FrameSink>);

pub struct Connection {
    id: String,
    device_sn: String,
    user_id: String,
    connected_at: DateTime<Utc>,
    config: ConnectionConfig,
    send_tx: mpsc::Sender<Message>,
    control_tx: mpsc::Sender<Frame>,
    /// Taken by `start()`; `None` afterwards, or after a close before start.
    pending: Mutex<Option<(Halves, mpsc::Receiver<Message>, mpsc::Receiver<Frame>)>>,
    subscriptions: RwLock<HashSet<String>>,
    closed: AtomicBool,
    state: AtomicU8,
    live_loops: AtomicUsize,
    dropped: AtomicU64,
    shutdown: CancellationToken,
}

impl Connection {
    /// Wrap an accepted transport. Nothing runs until [`Connection::start`].
    pub fn new(
        id: impl Into<String>,
        device_sn: impl Into<String>,
        user_id: impl Into<String>,
        source: impl FrameSource + 'static,
        sink: impl FrameSink + 'static,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(config.send_buffer_size.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
        let halves: Halves = (Box::new(source), Box::new(sink));

        Arc::new(Self {
            id: id.into(),
            device_sn: device_sn.into(),
            user_id: user_id.into(),
            connected_at: Utc::now(),
            config,
            send_tx,
            control_tx,
            pending: Mutex::new(Some((halves, send_rx, control_rx))),
            subscriptions: RwLock::new(HashSet::new()),
            closed: AtomicBool::new(false),
            state: AtomicU8::new(0),
            live_loops: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_sn(&self) -> &str {
        &self.device_sn
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Messages discarded because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue `msg` for delivery without waiting.
    ///
    /// Returns `false` when the connection is closed or the queue is full;
    /// in the latter case the message is dropped and counted.
    pub fn send(&self, msg: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.send_tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    conn_id = %self.id,
                    event = %msg.event,
                    dropped,
                    "send queue full, message dropped"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn subscribe(&self, topic: &str) {
        self.subscriptions
            .write()
            .expect("subscription set poisoned")
            .insert(topic.to_string());
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.subscriptions
            .write()
            .expect("subscription set poisoned")
            .remove(topic);
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .read()
            .expect("subscription set poisoned")
            .contains(topic)
    }

    /// Topics this connection subscribed to, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .read()
            .expect("subscription set poisoned")
            .iter()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Close the connection. Idempotent and safe from any task.
    ///
    /// Signals both loops to exit; the outbound loop sends a close frame and
    /// releases the sink. Queued messages are abandoned.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.state.store(1, Ordering::Release);
        self.shutdown.cancel();

        // Never started: drop the transport and queue here, nothing else will.
        let never_started = self
            .pending
            .lock()
            .expect("connection state poisoned")
            .take()
            .is_some();
        if never_started {
            self.state.store(2, Ordering::Release);
        }
        debug!(conn_id = %self.id, "connection closing");
    }

    /// Spawn the inbound and outbound loops. Only the first call has effect.
    pub fn start(self: &Arc<Self>, hub: Hub) {
        let taken = {
            let mut pending = self.pending.lock().expect("connection state poisoned");
            let taken = pending.take();
            if taken.is_some() {
                self.live_loops.store(2, Ordering::Release);
            }
            taken
        };
        let Some(((source, sink), send_rx, control_rx)) = taken else {
            debug!(conn_id = %self.id, "start ignored: already started or closed");
            return;
        };

        info!(conn_id = %self.id, device_sn = %self.device_sn, "connection started");

        tokio::spawn(Arc::clone(self).read_loop(source, hub));
        tokio::spawn(Arc::clone(self).write_loop(sink, send_rx, control_rx));
    }

    /// Read side: one frame at a time, bounded by the pong deadline.
    async fn read_loop(self: Arc<Self>, mut source: Box<dyn FrameSource>, hub: Hub) {
        let pong_wait = self.config.pong_wait();
        let mut deadline = Instant::now() + pong_wait;

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = timeout_at(deadline, source.next_frame()) => next,
            };

            let frame = match next {
                Err(_) => {
                    warn!(conn_id = %self.id, pong_wait_ms = self.config.pong_wait_ms, "read deadline exceeded");
                    break;
                }
                Ok(None) => {
                    debug!(conn_id = %self.id, "peer went away");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(conn_id = %self.id, error = %e, "transport read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            if frame.len() > self.config.max_message_size {
                let e = TransportError::FrameTooLarge {
                    size: frame.len(),
                    max: self.config.max_message_size,
                };
                warn!(conn_id = %self.id, error = %e, "closing connection");
                break;
            }

            match frame {
                Frame::Text(text) => self.handle_payload(text.as_bytes(), &hub),
                Frame::Binary(bytes) => self.handle_payload(&bytes, &hub),
                Frame::Pong(_) => deadline = Instant::now() + pong_wait,
                Frame::Ping(payload) => {
                    if self.control_tx.try_send(Frame::Pong(payload)).is_err() {
                        debug!(conn_id = %self.id, "control queue full, pong skipped");
                    }
                }
                Frame::Close => {
                    debug!(conn_id = %self.id, "close frame received");
                    break;
                }
            }
        }

        hub.unregister(&self);
        self.close();
        self.finish_loop();
    }

    fn handle_payload(self: &Arc<Self>, payload: &[u8], hub: &Hub) {
        match serde_json::from_slice::<Message>(payload) {
            Ok(msg) => self.handle_message(msg, hub),
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "malformed frame");
                self.send(Message::error("invalid message format"));
            }
        }
    }

    fn handle_message(self: &Arc<Self>, msg: Message, hub: &Hub) {
        match msg.msg_type {
            MessageType::Ping => {
                self.send(Message::pong().with_trace_id(msg.trace_id));
            }
            MessageType::Subscribe | MessageType::Unsubscribe => {
                if msg.event.is_empty() {
                    let reason = format!("{} requires a topic in \"event\"", msg.msg_type);
                    self.send(Message::error(reason).with_trace_id(msg.trace_id));
                    return;
                }
                if msg.msg_type == MessageType::Subscribe {
                    self.subscribe(&msg.event);
                } else {
                    self.unsubscribe(&msg.event);
                }
                debug!(conn_id = %self.id, kind = %msg.msg_type, topic = %msg.event, "subscription changed");
                self.send(Message::ack(msg.event.clone()).with_trace_id(msg.trace_id.clone()));
                hub.notify_message(self, msg);
            }
            _ => hub.notify_message(self, msg),
        }
    }

    /// Write side: queued messages, control replies and keepalive pings, each
    /// write bounded by `write_wait`.
    async fn write_loop(
        self: Arc<Self>,
        mut sink: Box<dyn FrameSink>,
        mut queue: mpsc::Receiver<Message>,
        mut control: mpsc::Receiver<Frame>,
    ) {
        let write_wait = self.config.write_wait();
        let period = self.config.ping_period();
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(frame) = control.recv() => frame,
                Some(msg) = queue.recv() => match msg.to_json() {
                    Ok(text) => Frame::Text(text),
                    Err(e) => {
                        warn!(conn_id = %self.id, error = %e, "message serialization failed");
                        continue;
                    }
                },
                _ = keepalive.tick() => Frame::Ping(Vec::new()),
            };

            if let Err(e) = write_frame(sink.as_mut(), frame, write_wait).await {
                warn!(conn_id = %self.id, error = %e, "transport write failed");
                break;
            }
        }

        let _ = write_frame(sink.as_mut(), Frame::Close, write_wait).await;
        let _ = timeout(write_wait, sink.close()).await;
        self.close();
        self.finish_loop();
    }

    fn finish_loop(&self) {
        if self.live_loops.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.store(2, Ordering::Release);
            debug!(conn_id = %self.id, "connection closed");
        }
    }

    /// Drain everything currently queued. Only valid before `start()`.
    #[cfg(test)]
    pub(crate) fn drain_queue(&self) -> Vec<Message> {
        let mut pending = self.pending.lock().unwrap();
        let mut out = Vec::new();
        if let Some((_, rx, _)) = pending.as_mut() {
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
        }
        out
    }
}

async fn write_frame(
    sink: &mut dyn FrameSink,
    frame: Frame,
    wait: Duration,
) -> Result<(), TransportError> {
    match timeout(wait, sink.send_frame(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            ms: wait.as_millis() as u64,
        }),
    }
}
