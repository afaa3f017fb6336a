use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fleetcast_core::PusherConfig;
use fleetcast_protocol::Message;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::subscription::SubscriptionIndex;

/// Who a [`PushJob`] is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Subscribers of exactly this topic.
    Topic(String),
    /// Subscribers of any topic matching a wildcard pattern.
    Pattern(String),
    /// These connection ids, regardless of subscriptions.
    Clients(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct PushJob {
    pub audience: Audience,
    pub message: Message,
    /// Ids removed from the resolved audience.
    pub exclude: Vec<String>,
}

impl PushJob {
    pub fn topic(topic: impl Into<String>, message: Message) -> Self {
        Self {
            audience: Audience::Topic(topic.into()),
            message,
            exclude: Vec::new(),
        }
    }

    pub fn pattern(pattern: impl Into<String>, message: Message) -> Self {
        Self {
            audience: Audience::Pattern(pattern.into()),
            message,
            exclude: Vec::new(),
        }
    }

    pub fn clients(ids: Vec<String>, message: Message) -> Self {
        Self {
            audience: Audience::Clients(ids),
            message,
            exclude: Vec::new(),
        }
    }

    pub fn excluding(mut self, ids: Vec<String>) -> Self {
        self.exclude = ids;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushMetrics {
    /// Messages successfully enqueued on a connection.
    pub pushed: u64,
    /// Jobs rejected because the queue was full.
    pub dropped: u64,
}

struct Running {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

struct PusherInner {
    hub: Hub,
    index: Arc<SubscriptionIndex>,
    config: PusherConfig,
    job_tx: mpsc::Sender<PushJob>,
    /// Shared by all workers; whoever holds the lock takes the next job.
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PushJob>>>,
    accepting: AtomicBool,
    running: Mutex<Option<Running>>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// Fan-out dispatcher: resolves a job's audience and enqueues the message on
/// each live connection through a fixed pool of workers.
///
/// Publishers never wait: [`Pusher::push`] either queues the job or drops it.
#[derive(Clone)]
pub struct Pusher {
    inner: Arc<PusherInner>,
}

impl Pusher {
    pub fn new(hub: Hub, index: Arc<SubscriptionIndex>, config: PusherConfig) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            inner: Arc::new(PusherInner {
                hub,
                index,
                config,
                job_tx,
                job_rx: Arc::new(tokio::sync::Mutex::new(job_rx)),
                accepting: AtomicBool::new(false),
                running: Mutex::new(None),
                pushed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the worker pool. No-op when already running.
    pub fn start(&self) {
        let mut running = self.inner.running.lock().expect("pusher lifecycle poisoned");
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let workers = (0..self.inner.config.worker_count.max(1))
            .map(|n| tokio::spawn(Arc::clone(&self.inner).worker(n, token.clone())))
            .collect();
        *running = Some(Running { token, workers });
        self.inner.accepting.store(true, Ordering::Release);
        info!(
            workers = self.inner.config.worker_count,
            queue_size = self.inner.config.queue_size,
            "pusher started"
        );
    }

    /// Stop accepting jobs and wait for the workers to exit. Jobs still queued
    /// stay queued and are served after the next `start()`.
    pub async fn stop(&self) {
        let Some(running) = self
            .inner
            .running
            .lock()
            .expect("pusher lifecycle poisoned")
            .take()
        else {
            return;
        };

        self.inner.accepting.store(false, Ordering::Release);
        running.token.cancel();
        for worker in running.workers {
            let _ = worker.await;
        }
        info!(pending = self.queue_len(), "pusher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Queue a job without waiting.
    ///
    /// Returns `false` when the pusher is stopped or the queue is full; only
    /// the latter counts toward `dropped`.
    pub fn push(&self, job: PushJob) -> bool {
        if !self.is_running() {
            debug!("push rejected: pusher not running");
            return false;
        }
        match self.inner.job_tx.try_send(job) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, queue_size = self.inner.config.queue_size, "push queue full, job dropped");
                false
            }
        }
    }

    pub fn push_to_topic(&self, topic: &str, message: Message) -> bool {
        self.push(PushJob::topic(topic, message))
    }

    pub fn push_to_pattern(&self, pattern: &str, message: Message) -> bool {
        self.push(PushJob::pattern(pattern, message))
    }

    pub fn push_to_clients(&self, ids: Vec<String>, message: Message) -> bool {
        self.push(PushJob::clients(ids, message))
    }

    pub fn push_to_topic_excluding(
        &self,
        topic: &str,
        message: Message,
        exclude: Vec<String>,
    ) -> bool {
        self.push(PushJob::topic(topic, message).excluding(exclude))
    }

    /// Deliver to every registered connection, bypassing subscriptions.
    pub fn broadcast(&self, message: Message) -> bool {
        self.inner.hub.broadcast(message)
    }

    pub fn metrics(&self) -> PushMetrics {
        PushMetrics {
            pushed: self.inner.pushed.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Jobs waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.inner.job_tx.max_capacity() - self.inner.job_tx.capacity()
    }
}

impl PusherInner {
    async fn worker(self: Arc<Self>, n: usize, token: CancellationToken) {
        debug!(worker = n, "push worker started");
        loop {
            let job = {
                let mut rx = tokio::select! {
                    _ = token.cancelled() => break,
                    rx = self.job_rx.lock() => rx,
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    job = rx.recv() => job,
                }
            };
            match job {
                Some(job) => self.deliver(job),
                None => break,
            }
        }
        debug!(worker = n, "push worker exited");
    }

    fn deliver(&self, job: PushJob) {
        let targets = match &job.audience {
            Audience::Clients(ids) => ids.clone(),
            Audience::Topic(topic) => self.index.subscribers(topic),
            Audience::Pattern(pattern) => self.index.subscribers_matching(pattern),
        };
        if targets.is_empty() {
            debug!(audience = ?job.audience, "push has no audience");
            return;
        }

        let exclude: HashSet<&str> = job.exclude.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = HashSet::with_capacity(targets.len());
        let mut delivered = 0u64;
        for id in &targets {
            if exclude.contains(id.as_str()) || !seen.insert(id.as_str()) {
                continue;
            }
            if self.hub.send_to_client(id, job.message.clone()) {
                delivered += 1;
            }
        }

        self.pushed.fetch_add(delivered, Ordering::Relaxed);
        debug!(
            audience = ?job.audience,
            event = %job.message.event,
            targets = targets.len(),
            delivered,
            "push delivered"
        );
    }
}
