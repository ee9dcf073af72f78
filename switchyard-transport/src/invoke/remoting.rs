//! Sending commands and correlating their responses.

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::TimeProvider;

use super::{InvokeCallback, InvokeFuture, TimeoutScheduler};
use crate::RemotingError;
use crate::command::RemotingCommand;
use crate::connection::Connection;

/// Send paths shared by clients and servers.
#[derive(Clone)]
pub struct Remoting<T: TimeProvider> {
    time: T,
    timer: Arc<TimeoutScheduler>,
}

impl<T: TimeProvider> Remoting<T> {
    /// Send paths reading the clock from `time` and scheduling on `timer`.
    pub fn new(time: T, timer: Arc<TimeoutScheduler>) -> Self {
        Self { time, timer }
    }

    /// The shared timeout scheduler.
    pub fn timer(&self) -> &Arc<TimeoutScheduler> {
        &self.timer
    }

    /// Fire-and-forget send.
    ///
    /// No future is created. Write failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` without writing if the deadline has passed.
    pub fn send_oneway(&self, connection: &Connection, command: RemotingCommand) -> Result<(), RemotingError> {
        if command.is_expired(self.time.now_millis()) {
            return Err(RemotingError::DeadlineExceeded { id: command.id });
        }
        let id = command.id;
        if let Err(e) = connection.write_detached(command) {
            tracing::warn!(connection = connection.id(), id, error = %e, "oneway send failed");
        }
        Ok(())
    }

    /// Send `command` and return the future its response resolves.
    ///
    /// The future always resolves: with the response, a timeout when the
    /// deadline passes, a send failure, or a closed connection. A command
    /// already past its deadline resolves with a timeout without touching
    /// the connection. A zero deadline never times out.
    pub fn send_future(
        &self,
        connection: &Arc<Connection>,
        command: RemotingCommand,
        callback: Option<Arc<dyn InvokeCallback>>,
    ) -> Arc<InvokeFuture> {
        let future = Arc::new(InvokeFuture::for_request(&command).with_callback(callback));
        let now = self.time.now_millis();

        if command.is_expired(now) {
            tracing::debug!(id = command.id, "deadline passed before send");
            future.expire("deadline exceeded before send");
            return future;
        }

        if command.deadline_millis != 0 {
            let delay = Duration::from_millis(command.deadline_millis - now);
            let weak = Arc::downgrade(connection);
            let pending = future.clone();
            self.timer.schedule(
                delay,
                Box::new(move || {
                    if let Some(connection) = weak.upgrade() {
                        connection.remove_future_matching(pending.id(), &pending);
                    }
                    if pending.expire("invoke timed out") {
                        tracing::debug!(id = pending.id(), "invoke timed out");
                    }
                }),
            );
        }

        if let Err(e) = connection.write_with_future(command, future.clone()) {
            tracing::debug!(connection = connection.id(), id = future.id(), error = %e, "send rejected");
        }
        future
    }

    /// Send `command` and wait for its response.
    pub async fn send_sync(&self, connection: &Arc<Connection>, command: RemotingCommand) -> RemotingCommand {
        self.send_future(connection, command, None)
            .await_response()
            .await
    }

    /// Send `command`; `callback` receives the outcome. Never waits.
    pub fn send_async(
        &self,
        connection: &Arc<Connection>,
        command: RemotingCommand,
        callback: Arc<dyn InvokeCallback>,
    ) {
        self.send_future(connection, command, Some(callback));
    }
}
