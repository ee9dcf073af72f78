//! Invoking remote processors.

use std::sync::{Arc, Weak};
use std::time::Duration;

use switchyard_core::{Providers, TimeProvider, Url};

use crate::RemotingError;
use crate::command::RemotingCommand;
use crate::connection::{Connection, ConnectionManager, PoolHealer, ReconnectManager, Reconnector};
use crate::context::TransportContext;
use crate::invoke::{InvokeCallback, InvokeFuture, Remoting};

/// Client side of the runtime: pooled connections plus the send paths.
///
/// Every invocation takes a timeout that becomes the command's absolute
/// deadline; the deadline travels with the command so the server can skip
/// work the client no longer waits for.
pub struct RemotingClient<P: Providers> {
    ctx: Arc<TransportContext<P>>,
    manager: Arc<ConnectionManager<P>>,
    remoting: Remoting<P::Time>,
    reconnect: Option<Arc<ReconnectManager<P>>>,
}

impl<P: Providers> RemotingClient<P> {
    /// Client using the protocols and registries of `ctx`.
    pub fn new(ctx: Arc<TransportContext<P>>) -> Self {
        let manager = ConnectionManager::new(
            ctx.providers().clone(),
            ctx.protocols().clone(),
            ctx.config().clone(),
        );
        let reconnect = ctx.config().enable_reconnect.then(|| {
            let healer: Weak<dyn PoolHealer> = Arc::downgrade(&manager) as Weak<dyn PoolHealer>;
            let reconnect = Arc::new(ReconnectManager::new(
                ctx.providers().clone(),
                healer,
                ctx.config().reconnect_interval,
            ));
            manager.set_reconnector(reconnect.clone());
            reconnect
        });
        Self {
            remoting: ctx.remoting(),
            ctx,
            manager,
            reconnect,
        }
    }

    /// Start background workers.
    pub fn start(&self) {
        if let Some(reconnect) = &self.reconnect {
            reconnect.start();
        }
    }

    /// The connection manager.
    pub fn connection_manager(&self) -> &Arc<ConnectionManager<P>> {
        &self.manager
    }

    /// The reconnect manager, when reconnection is enabled.
    pub fn reconnect_manager(&self) -> Option<&Arc<ReconnectManager<P>>> {
        self.reconnect.as_ref()
    }

    /// A pooled connection to `url`, dialing if needed.
    pub async fn connection(&self, url: &Url) -> Result<Arc<Connection>, RemotingError> {
        Ok(self.manager.get_or_create_connection(url).await?)
    }

    fn prepare(&self, connection: &Connection, command: RemotingCommand, timeout: Duration) -> RemotingCommand {
        let deadline = self.ctx.providers().time().now_millis() + timeout.as_millis() as u64;
        command
            .with_id(connection.next_request_id())
            .with_deadline(deadline)
    }

    /// Send `command` and wait up to `timeout` for the response.
    ///
    /// # Errors
    ///
    /// Dial failures, timeouts, send failures, closed connections and
    /// failed remote processing all come back as errors.
    pub async fn invoke_sync(
        &self,
        url: &Url,
        command: RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingCommand, RemotingError> {
        let connection = self.connection(url).await?;
        let command = self.prepare(&connection, command, timeout);
        self.remoting
            .send_sync(&connection, command)
            .await
            .into_result()
    }

    /// Send `command` and return the future of its response.
    pub async fn invoke_future(
        &self,
        url: &Url,
        command: RemotingCommand,
        timeout: Duration,
    ) -> Result<Arc<InvokeFuture>, RemotingError> {
        let connection = self.connection(url).await?;
        let command = self.prepare(&connection, command, timeout);
        Ok(self.remoting.send_future(&connection, command, None))
    }

    /// Send `command`; `callback` receives the response or failure.
    pub async fn invoke_with_callback(
        &self,
        url: &Url,
        command: RemotingCommand,
        timeout: Duration,
        callback: Arc<dyn InvokeCallback>,
    ) -> Result<(), RemotingError> {
        let connection = self.connection(url).await?;
        let command = self.prepare(&connection, command, timeout);
        self.remoting.send_async(&connection, command, callback);
        Ok(())
    }

    /// Send a one-way `command`. Nothing waits for an answer.
    pub async fn oneway(&self, url: &Url, command: RemotingCommand) -> Result<(), RemotingError> {
        let connection = self.connection(url).await?;
        let command = command.with_id(connection.next_request_id());
        self.remoting.send_oneway(&connection, command)
    }

    /// Stop reconnecting to `url`'s pool after failures.
    pub fn disable_reconnect(&self, url: &Url) {
        if let Some(reconnect) = &self.reconnect {
            reconnect.disable(&url.pool_key());
        }
    }

    /// Resume reconnecting to `url`'s pool.
    pub fn enable_reconnect(&self, url: &Url) {
        if let Some(reconnect) = &self.reconnect {
            reconnect.enable(&url.pool_key());
        }
    }

    /// Stop background work and close every pooled connection.
    pub fn shutdown(&self) {
        if let Some(reconnect) = &self.reconnect {
            reconnect.shutdown();
        }
        self.manager.close_all();
        tracing::info!("client stopped");
    }
}
