//! One-shot response cells.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use switchyard_core::{CommandCode, ProtocolCode};
use tokio::sync::Notify;

use crate::command::{RemotingCommand, ResponseStatus};

/// Where an [`InvokeCallback`] runs.
#[derive(Debug, Clone, Default)]
pub enum CallbackExecutor {
    /// On whichever task resolved the future.
    #[default]
    Inline,
    /// Spawned onto the given runtime.
    Runtime(tokio::runtime::Handle),
}

/// Notified when an invoke future resolves.
pub trait InvokeCallback: Send + Sync {
    /// Called once with the resolved response, real or synthetic.
    fn on_complete(&self, response: RemotingCommand);

    /// Called when the request timed out, before `on_complete`.
    fn on_timeout(&self, _id: u32) {}

    /// Where the callback runs.
    fn executor(&self) -> CallbackExecutor {
        CallbackExecutor::Inline
    }
}

/// Pending response for one request id.
///
/// The first [`put_response`](Self::put_response) wins; later ones are
/// ignored and return `false`.
pub struct InvokeFuture {
    id: u32,
    protocol: ProtocolCode,
    command: CommandCode,
    response: OnceLock<RemotingCommand>,
    notify: Notify,
    callback: Option<Arc<dyn InvokeCallback>>,
}

impl InvokeFuture {
    /// Future for request `id`.
    pub fn new(id: u32, protocol: ProtocolCode, command: CommandCode) -> Self {
        Self {
            id,
            protocol,
            command,
            response: OnceLock::new(),
            notify: Notify::new(),
            callback: None,
        }
    }

    /// Future for `request`.
    pub fn for_request(request: &RemotingCommand) -> Self {
        Self::new(request.id, request.protocol, request.command)
    }

    /// Attach a callback fired on resolution.
    pub fn with_callback(mut self, callback: Option<Arc<dyn InvokeCallback>>) -> Self {
        self.callback = callback;
        self
    }

    /// Request id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether a response has been stored.
    pub fn is_done(&self) -> bool {
        self.response.get().is_some()
    }

    /// The stored response, if any.
    pub fn try_response(&self) -> Option<RemotingCommand> {
        self.response.get().cloned()
    }

    /// Store `response` and wake waiters. Returns `false` if already resolved.
    ///
    /// Does not run the callback; see [`complete`](Self::complete).
    pub fn put_response(&self, response: RemotingCommand) -> bool {
        if self.response.set(response).is_err() {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Resolve with `response` and run the callback.
    pub fn complete(&self, response: RemotingCommand) -> bool {
        let callback_copy = self.callback.as_ref().map(|_| response.clone());
        if !self.put_response(response) {
            return false;
        }
        if let Some(response) = callback_copy {
            self.run_callback(move |callback| callback.on_complete(response));
        }
        true
    }

    /// Resolve with a synthetic timeout and fire both callback hooks.
    pub fn expire(&self, message: &str) -> bool {
        let response = self.synthetic(ResponseStatus::Timeout, message);
        let callback_copy = self.callback.as_ref().map(|_| response.clone());
        if !self.put_response(response) {
            return false;
        }
        if let Some(response) = callback_copy {
            let id = self.id;
            self.run_callback(move |callback| {
                callback.on_timeout(id);
                callback.on_complete(response);
            });
        }
        true
    }

    /// Resolve with a synthetic failure of `status`.
    pub fn fail(&self, status: ResponseStatus, message: &str) -> bool {
        self.complete(self.synthetic(status, message))
    }

    fn synthetic(&self, status: ResponseStatus, message: &str) -> RemotingCommand {
        RemotingCommand::synthetic(self.id, self.protocol, self.command, status, message)
    }

    fn run_callback<F>(&self, f: F)
    where
        F: FnOnce(&dyn InvokeCallback) + Send + 'static,
    {
        let Some(callback) = self.callback.clone() else {
            return;
        };
        let id = self.id;
        let executor = callback.executor();
        let run = move || {
            if catch_unwind(AssertUnwindSafe(|| f(callback.as_ref()))).is_err() {
                tracing::error!(id, "invoke callback panicked");
            }
        };
        match executor {
            CallbackExecutor::Inline => run(),
            CallbackExecutor::Runtime(handle) => {
                handle.spawn(async move { run() });
            }
        }
    }

    /// Wait for the response.
    pub async fn await_response(&self) -> RemotingCommand {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(response) = self.response.get() {
                return response.clone();
            }
            notified.await;
        }
    }

    /// Wait for the response for at most `timeout`.
    pub async fn await_response_timeout(&self, timeout: Duration) -> Option<RemotingCommand> {
        tokio::time::timeout(timeout, self.await_response()).await.ok()
    }
}

impl std::fmt::Debug for InvokeFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeFuture")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const PROTO: ProtocolCode = ProtocolCode::new(1);
    const CMD: CommandCode = CommandCode::new(7);

    #[derive(Default)]
    struct Counting {
        completes: AtomicUsize,
        timeouts: AtomicUsize,
        last: Mutex<Option<ResponseStatus>>,
    }

    impl InvokeCallback for Counting {
        fn on_complete(&self, response: RemotingCommand) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().expect("lock") = Some(response.status);
        }

        fn on_timeout(&self, _id: u32) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl InvokeCallback for Panicking {
        fn on_complete(&self, _response: RemotingCommand) {
            panic!("callback failure");
        }
    }

    fn response(id: u32) -> RemotingCommand {
        RemotingCommand::synthetic(id, PROTO, CMD, ResponseStatus::Success, "")
    }

    #[test]
    fn test_first_put_wins() {
        let future = InvokeFuture::new(3, PROTO, CMD);
        assert!(future.put_response(response(3)));
        assert!(!future.expire("late"));
        assert_eq!(future.try_response().expect("resolved").status, ResponseStatus::Success);
    }

    #[test]
    fn test_racing_resolutions_resolve_once() {
        for _ in 0..50 {
            let callback = Arc::new(Counting::default());
            let future = Arc::new(
                InvokeFuture::new(5, PROTO, CMD).with_callback(Some(callback.clone())),
            );

            let responder = {
                let future = future.clone();
                std::thread::spawn(move || future.complete(response(5)))
            };
            let timer = {
                let future = future.clone();
                std::thread::spawn(move || future.expire("timed out"))
            };
            let wins = [
                responder.join().expect("responder"),
                timer.join().expect("timer"),
            ];

            assert_eq!(wins.iter().filter(|w| **w).count(), 1);
            assert_eq!(callback.completes.load(Ordering::SeqCst), 1);
            let status = future.try_response().expect("resolved").status;
            assert_eq!(*callback.last.lock().expect("lock"), Some(status));
            let expected_timeouts = usize::from(status == ResponseStatus::Timeout);
            assert_eq!(callback.timeouts.load(Ordering::SeqCst), expected_timeouts);
        }
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let future = InvokeFuture::new(1, PROTO, CMD).with_callback(Some(Arc::new(Panicking)));
        assert!(future.complete(response(1)));
        assert!(future.is_done());
    }

    #[tokio::test]
    async fn test_await_sees_later_response() {
        let future = Arc::new(InvokeFuture::new(8, PROTO, CMD));
        let waiter = {
            let future = future.clone();
            tokio::spawn(async move { future.await_response().await })
        };
        tokio::task::yield_now().await;
        future.put_response(response(8));
        let got = waiter.await.expect("join");
        assert_eq!(got.id, 8);
    }

    #[tokio::test]
    async fn test_await_timeout_returns_none() {
        let future = InvokeFuture::new(2, PROTO, CMD);
        assert!(future.await_response_timeout(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_runtime_executor_runs_callback() {
        struct OnRuntime(tokio::sync::mpsc::UnboundedSender<u32>, tokio::runtime::Handle);

        impl InvokeCallback for OnRuntime {
            fn on_complete(&self, response: RemotingCommand) {
                let _ = self.0.send(response.id);
            }

            fn executor(&self) -> CallbackExecutor {
                CallbackExecutor::Runtime(self.1.clone())
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback = Arc::new(OnRuntime(tx, tokio::runtime::Handle::current()));
        let future = InvokeFuture::new(4, PROTO, CMD).with_callback(Some(callback));
        future.complete(response(4));
        assert_eq!(rx.recv().await, Some(4));
    }
}
