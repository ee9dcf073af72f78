//! Shared timeout scheduling.
//!
//! One background task owns a min-heap of deadlines for every scheduled
//! timeout in the runtime. Timeouts are never cancelled explicitly: a task
//! whose future was already resolved finds nothing to do when it fires.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use switchyard_core::TaskProvider;
use tokio::sync::mpsc;
use tokio::time::Instant;

type TimerTask = Box<dyn FnOnce() + Send>;

enum TimerCommand {
    Schedule(Entry),
    Shutdown,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    task: TimerTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed: BinaryHeap is a max-heap and the earliest deadline must pop first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Runs tasks after a delay on a single background worker.
pub struct TimeoutScheduler {
    commands: mpsc::UnboundedSender<TimerCommand>,
    seq: AtomicU64,
    pending: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl TimeoutScheduler {
    /// Start the scheduler's worker on `tasks`.
    pub fn start<T: TaskProvider>(tasks: &T) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tasks.spawn_task("timeout_scheduler", run(rx, pending.clone()));
        Arc::new(Self {
            commands: tx,
            seq: AtomicU64::new(0),
            pending,
            stopped: AtomicBool::new(false),
        })
    }

    /// Run `task` once `delay` has elapsed.
    ///
    /// After shutdown the task runs immediately on the caller and `false` is
    /// returned.
    pub fn schedule(&self, delay: Duration, task: TimerTask) -> bool {
        if self.stopped.load(AtomicOrdering::SeqCst) {
            task();
            return false;
        }
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        };
        self.pending.fetch_add(1, AtomicOrdering::SeqCst);
        match self.commands.send(TimerCommand::Schedule(entry)) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                self.pending.fetch_sub(1, AtomicOrdering::SeqCst);
                if let TimerCommand::Schedule(entry) = command {
                    (entry.task)();
                }
                false
            }
        }
    }

    /// Scheduled tasks not yet run.
    pub fn pending(&self) -> usize {
        self.pending.load(AtomicOrdering::SeqCst)
    }

    /// Stop the worker, running every remaining task right away.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, AtomicOrdering::SeqCst) {
            let _ = self.commands.send(TimerCommand::Shutdown);
        }
    }
}

impl std::fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<TimerCommand>, pending: Arc<AtomicUsize>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();

    loop {
        let next_deadline = heap.peek().map(|entry| entry.deadline);
        let sleep = async {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(TimerCommand::Schedule(entry)) => heap.push(entry),
                Some(TimerCommand::Shutdown) | None => break,
            },
            _ = sleep => {
                let now = Instant::now();
                while heap.peek().is_some_and(|entry| entry.deadline <= now) {
                    if let Some(entry) = heap.pop() {
                        pending.fetch_sub(1, AtomicOrdering::SeqCst);
                        (entry.task)();
                    }
                }
            }
        }
    }

    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let TimerCommand::Schedule(entry) = command {
            heap.push(entry);
        }
    }
    tracing::debug!(remaining = heap.len(), "timeout scheduler stopping");
    while let Some(entry) = heap.pop() {
        pending.fetch_sub(1, AtomicOrdering::SeqCst);
        (entry.task)();
    }
}
