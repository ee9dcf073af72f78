//! Bounded pool for off-loaded dispatch.

use std::future::Future;
use std::sync::Arc;

use switchyard_core::TaskProvider;
use tokio::sync::Semaphore;

/// Runs jobs on spawned tasks, at most `size` at a time.
///
/// Submission never waits: a full pool rejects the job.
#[derive(Clone)]
pub struct WorkerPool<T: TaskProvider> {
    tasks: T,
    permits: Arc<Semaphore>,
    size: usize,
}

impl<T: TaskProvider> WorkerPool<T> {
    /// Pool running up to `size` jobs concurrently.
    pub fn new(tasks: T, size: usize) -> Self {
        Self {
            tasks,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `job(input)` if a slot is free, otherwise hand `input` back.
    pub fn try_submit<I, F, Fut>(&self, input: I, job: F) -> Result<(), I>
    where
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return Err(input);
        };
        let work = job(input);
        self.tasks.spawn_task("dispatch_worker", async move {
            work.await;
            drop(permit);
        });
        Ok(())
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Configured size.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl<T: TaskProvider> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::TokioTaskProvider;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_full_pool_rejects_and_returns_input() {
        let pool = WorkerPool::new(TokioTaskProvider, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        assert!(pool
            .try_submit(release_rx, |rx| async move {
                let _ = rx.await;
            })
            .is_ok());
        assert_eq!(pool.available(), 0);

        let rejected = pool.try_submit(42u32, |_| async {});
        assert_eq!(rejected, Err(42));

        release_tx.send(()).expect("worker waiting");
        for _ in 0..100 {
            if pool.available() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_zero_sized_pool_rejects_everything() {
        let pool = WorkerPool::new(TokioTaskProvider, 0);
        assert!(pool.try_submit((), |_| async {}).is_err());
    }
}
