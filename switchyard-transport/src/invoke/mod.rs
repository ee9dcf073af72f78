//! Request/response correlation.
//!
//! An [`InvokeFuture`] is the one-shot cell a caller waits on for the
//! response to one request id. [`Remoting`] wires futures to connections and
//! to the shared [`TimeoutScheduler`] so every future resolves exactly once:
//! with the response, a timeout, a send failure, or a closed connection.

mod future;
mod remoting;
mod timer;

pub use future::{CallbackExecutor, InvokeCallback, InvokeFuture};
pub use remoting::Remoting;
pub use timer::TimeoutScheduler;
