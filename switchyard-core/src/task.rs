//! Task spawning abstraction.

use std::future::Future;
use tracing::Instrument;

/// Provider for spawning named background tasks.
///
/// Connection I/O loops, pool warm-up rounds, the reconnect worker and the
/// timeout scheduler all run through this trait.
pub trait TaskProvider: Clone + Send + Sync + 'static {
    /// Spawn a named task on the runtime.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based task provider.
#[derive(Clone, Debug, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("task", name = %name);
        tokio::spawn(future.instrument(span))
    }
}
