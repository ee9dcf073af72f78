//! Background re-healing of pools after connection failures.
//!
//! A single worker drains a queue of [`ReconnectTask`]s, spaced at least
//! `interval` apart. Failed tasks go back on the queue. Destinations can be
//! disabled, which skips their tasks until re-enabled; a task already being
//! run is not interrupted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use switchyard_core::{Providers, TaskProvider, TimeProvider, Url};
use tokio::sync::{mpsc, watch};

use super::ConnectError;

/// Something able to bring a destination's pool back to size.
#[async_trait]
pub trait PoolHealer: Send + Sync {
    /// Heal the pool for `url`.
    async fn heal(&self, url: &Url) -> Result<(), ConnectError>;
}

/// Accepts reconnect requests.
pub trait Reconnector: Send + Sync {
    /// Queue a reconnect for `url`. Returns `false` if the worker is not running.
    fn reconnect(&self, url: Url) -> bool;

    /// Skip queued tasks for pool `key` until [`enable`](Self::enable)d.
    fn disable(&self, key: &str);

    /// Undo [`disable`](Self::disable).
    fn enable(&self, key: &str);
}

/// A queued request to re-heal one destination.
#[derive(Debug, Clone)]
pub struct ReconnectTask {
    /// Destination to heal.
    pub url: Url,
    /// When the task was first queued.
    pub enqueued_at: Instant,
}

struct Shared {
    canceled: RwLock<HashSet<String>>,
    pending: AtomicUsize,
}

struct Running {
    queue: mpsc::UnboundedSender<ReconnectTask>,
    shutdown: watch::Sender<bool>,
}

/// Single-worker reconnect queue.
pub struct ReconnectManager<P: Providers> {
    providers: P,
    healer: Weak<dyn PoolHealer>,
    interval: Duration,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl<P: Providers> ReconnectManager<P> {
    /// Manager healing through `healer`, at most one task per `interval`.
    pub fn new(providers: P, healer: Weak<dyn PoolHealer>, interval: Duration) -> Self {
        Self {
            providers,
            healer,
            interval,
            shared: Arc::new(Shared {
                canceled: RwLock::new(HashSet::new()),
                pending: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the worker. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let (queue, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            time: self.providers.time().clone(),
            healer: self.healer.clone(),
            interval: self.interval,
            shared: self.shared.clone(),
            requeue: queue.clone(),
        };
        self.providers
            .task()
            .spawn_task("reconnect_worker", worker.run(rx, shutdown_rx));
        *running = Some(Running { queue, shutdown });
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "reconnect manager started");
        true
    }

    /// Stop the worker and drop queued tasks.
    pub fn shutdown(&self) {
        if let Some(running) = self.running.lock().take() {
            let _ = running.shutdown.send(true);
            self.shared.pending.store(0, Ordering::SeqCst);
            tracing::debug!("reconnect manager stopped");
        }
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Tasks queued and not yet taken by the worker.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Whether tasks for `key` are currently skipped.
    pub fn is_disabled(&self, key: &str) -> bool {
        self.shared.canceled.read().contains(key)
    }
}

impl<P: Providers> Reconnector for ReconnectManager<P> {
    fn reconnect(&self, url: Url) -> bool {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return false;
        };
        let task = ReconnectTask {
            url,
            enqueued_at: Instant::now(),
        };
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if running.queue.send(task).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn disable(&self, key: &str) {
        self.shared.canceled.write().insert(key.to_string());
    }

    fn enable(&self, key: &str) {
        self.shared.canceled.write().remove(key);
    }
}

impl<P: Providers> Drop for ReconnectManager<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<T: TimeProvider> {
    time: T,
    healer: Weak<dyn PoolHealer>,
    interval: Duration,
    shared: Arc<Shared>,
    requeue: mpsc::UnboundedSender<ReconnectTask>,
}

impl<T: TimeProvider> Worker<T> {
    async fn run(
        self,
        mut queue: mpsc::UnboundedReceiver<ReconnectTask>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_run: Option<Instant> = None;

        loop {
            let task = tokio::select! {
                _ = shutdown.changed() => break,
                task = queue.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);

            if let Some(wait) = last_run.and_then(|last| self.interval.checked_sub(last.elapsed())) {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = self.time.sleep(wait) => {}
                }
            }
            last_run = Some(Instant::now());

            let key = task.url.pool_key();
            if self.shared.canceled.read().contains(&key) {
                tracing::debug!(pool = %key, "reconnect disabled, skipping task");
                continue;
            }
            let Some(healer) = self.healer.upgrade() else {
                break;
            };

            match healer.heal(&task.url).await {
                Ok(()) => tracing::debug!(
                    pool = %key,
                    queued_ms = task.enqueued_at.elapsed().as_millis() as u64,
                    "reconnect succeeded"
                ),
                Err(e) => {
                    tracing::warn!(pool = %key, error = %e, "reconnect failed, requeueing");
                    self.shared.pending.fetch_add(1, Ordering::SeqCst);
                    if self.requeue.send(task).is_err() {
                        self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
        }
    }
}
