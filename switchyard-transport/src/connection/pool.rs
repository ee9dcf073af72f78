//! Per-destination connection pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use switchyard_core::{TaskProvider, Url};

use super::{ConnectError, Connection, ConnectionFactory, ConnectionSelectStrategy};

/// Result of a [`ConnectionPool::heal_to_target`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOutcome {
    /// The pool already held enough live connections.
    Satisfied,
    /// The target was reached by the inline dials.
    Completed,
    /// The inline dials succeeded and a background task is finishing the round.
    Started,
    /// Another round is in flight; this request was ignored.
    AlreadyWarming,
}

/// Live connections to one destination.
///
/// Readers select from an atomically swapped snapshot, so
/// [`get_connection`](Self::get_connection) never waits on a heal round.
pub struct ConnectionPool {
    key: String,
    connections: ArcSwap<Vec<Arc<Connection>>>,
    strategy: Arc<dyn ConnectionSelectStrategy>,
    warming: AtomicBool,
    max_connections: usize,
}

/// Holds the warm-up flag for one heal round.
struct WarmupGuard(Arc<ConnectionPool>);

impl Drop for WarmupGuard {
    fn drop(&mut self) {
        self.0.warming.store(false, Ordering::SeqCst);
    }
}

impl ConnectionPool {
    /// Empty pool for `key`, capped at `max_connections`.
    pub fn new(
        key: impl Into<String>,
        strategy: Arc<dyn ConnectionSelectStrategy>,
        max_connections: usize,
    ) -> Self {
        Self {
            key: key.into(),
            connections: ArcSwap::from_pointee(Vec::new()),
            strategy,
            warming: AtomicBool::new(false),
            max_connections: max_connections.max(1),
        }
    }

    /// Pool key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Add `connection`. Returns `false` if it is already pooled, closed, or
    /// the pool is full.
    pub fn add(&self, connection: Arc<Connection>) -> bool {
        if connection.is_closed() {
            return false;
        }
        let mut added = false;
        self.connections.rcu(|current| {
            added = current.len() < self.max_connections
                && !current.iter().any(|c| Arc::ptr_eq(c, &connection));
            let mut next = Vec::clone(current);
            if added {
                next.push(connection.clone());
            }
            next
        });
        added
    }

    /// Remove `connection`. Returns whether it was pooled.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let mut removed = false;
        self.connections.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|c| !Arc::ptr_eq(c, connection))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Select a live connection, pruning closed ones seen in the snapshot.
    pub fn get_connection(&self) -> Option<Arc<Connection>> {
        let snapshot = self.connections.load_full();
        let (live, dead): (Vec<_>, Vec<_>) =
            snapshot.iter().cloned().partition(|c| !c.is_closed());
        for connection in &dead {
            self.remove(connection);
        }
        self.strategy.select(&live)
    }

    /// Snapshot of every pooled connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.load().iter().cloned().collect()
    }

    /// Number of pooled connections still open.
    pub fn live_count(&self) -> usize {
        self.connections.load().iter().filter(|c| !c.is_closed()).count()
    }

    /// Whether a heal round is in flight.
    pub fn is_warming(&self) -> bool {
        self.warming.load(Ordering::SeqCst)
    }

    /// Close and remove every pooled connection.
    pub fn close_all(&self) {
        let drained = self.connections.swap(Arc::new(Vec::new()));
        for connection in drained.iter() {
            connection.close();
        }
    }

    /// Bring the pool up to `target` live connections.
    ///
    /// Up to `sync_count` connections are dialed before returning. The rest
    /// are dialed by a background task that stops at the first failure. The
    /// warm-up flag is held for the whole round, inline and background part.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed inline dial; the round ends with it.
    #[allow(clippy::too_many_arguments)]
    pub async fn heal_to_target<T: TaskProvider>(
        self: &Arc<Self>,
        factory: Arc<dyn ConnectionFactory>,
        url: &Url,
        target: usize,
        timeout: Duration,
        sync_count: usize,
        tasks: &T,
    ) -> Result<HealOutcome, ConnectError> {
        let target = target.clamp(1, self.max_connections);
        if self.live_count() >= target {
            return Ok(HealOutcome::Satisfied);
        }

        if self
            .warming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(pool = %self.key, "heal already in progress");
            return Ok(HealOutcome::AlreadyWarming);
        }
        let guard = WarmupGuard(self.clone());

        let mut dialed = 0;
        while dialed < sync_count && self.live_count() < target {
            let connection = factory.create(url, timeout).await?;
            if !self.add(connection.clone()) {
                connection.close();
                break;
            }
            dialed += 1;
        }

        if self.live_count() >= target {
            return Ok(HealOutcome::Completed);
        }

        let pool = self.clone();
        let url = url.clone();
        tasks.spawn_task("pool_warmup", async move {
            let _guard = guard;
            let started = Instant::now();
            let mut created = 0usize;
            while pool.live_count() < target {
                match factory.create(&url, timeout).await {
                    Ok(connection) => {
                        if !pool.add(connection.clone()) {
                            connection.close();
                            break;
                        }
                        created += 1;
                    }
                    Err(e) => {
                        tracing::warn!(pool = %pool.key, error = %e, "warm-up aborted");
                        break;
                    }
                }
            }
            tracing::info!(
                pool = %pool.key,
                created,
                live = pool.live_count(),
                target,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pool warm-up finished"
            );
        });
        Ok(HealOutcome::Started)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("connections", &self.connections.load().len())
            .field("warming", &self.is_warming())
            .finish()
    }
}
