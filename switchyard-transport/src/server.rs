//! Accepting connections.

use std::io;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use switchyard_core::{NetworkProvider, Providers, TaskProvider, TcpListenerTrait};
use tokio::sync::watch;

use crate::connection::{Connection, ConnectionEventListener, ConnectionManager, ConnectionOptions};
use crate::context::TransportContext;

/// Listens on an address and serves every registered protocol on it.
///
/// The protocol of each accepted connection is bound from its first frame.
pub struct RemotingServer<P: Providers> {
    ctx: Arc<TransportContext<P>>,
    address: String,
    manager: Option<Arc<ConnectionManager<P>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    local_addr: Mutex<Option<String>>,
    connections: Arc<Mutex<Vec<Weak<Connection>>>>,
}

impl<P: Providers> RemotingServer<P> {
    /// Server for `address`, e.g. `127.0.0.1:0`.
    pub fn new(ctx: Arc<TransportContext<P>>, address: impl Into<String>) -> Self {
        let manager = ctx
            .config()
            .server_manage_connection
            .then(|| ConnectionManager::inbound(ctx.providers().clone(), ctx.config().clone()));
        Self {
            ctx,
            address: address.into(),
            manager,
            shutdown: Mutex::new(None),
            local_addr: Mutex::new(None),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bind and start accepting. Returns the bound address.
    ///
    /// # Errors
    ///
    /// Fails if binding fails or the server is already running.
    pub async fn start(&self) -> io::Result<String> {
        if self.shutdown.lock().is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "server already started"));
        }
        let listener = self.ctx.providers().network().bind(&self.address).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = watch::channel(false);

        let accept = AcceptLoop {
            ctx: self.ctx.clone(),
            manager: self.manager.clone(),
            connections: self.connections.clone(),
        };
        self.ctx
            .providers()
            .task()
            .spawn_task("accept_loop", accept.run(listener, rx));

        *self.shutdown.lock() = Some(tx);
        *self.local_addr.lock() = Some(local_addr.clone());
        tracing::info!(address = %local_addr, protocols = ?self.ctx.protocols().codes(), "server listening");
        Ok(local_addr)
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<String> {
        self.local_addr.lock().clone()
    }

    /// Inbound connection registry, when the server manages connections.
    pub fn connection_manager(&self) -> Option<&Arc<ConnectionManager<P>>> {
        self.manager.as_ref()
    }

    /// Accepted connections still open.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut tracked = self.connections.lock();
        tracked.retain(|weak| weak.upgrade().is_some_and(|c| !c.is_closed()));
        tracked.iter().filter_map(Weak::upgrade).collect()
    }

    /// Stop accepting and close every accepted connection.
    pub fn shutdown(&self) {
        let Some(tx) = self.shutdown.lock().take() else {
            return;
        };
        let _ = tx.send(true);
        let tracked: Vec<_> = self.connections.lock().drain(..).collect();
        for connection in tracked.iter().filter_map(Weak::upgrade) {
            connection.close();
        }
        if let Some(manager) = &self.manager {
            manager.close_all();
        }
        tracing::info!(address = ?self.local_addr(), "server stopped");
    }
}

impl<P: Providers> Drop for RemotingServer<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct AcceptLoop<P: Providers> {
    ctx: Arc<TransportContext<P>>,
    manager: Option<Arc<ConnectionManager<P>>>,
    connections: Arc<Mutex<Vec<Weak<Connection>>>>,
}

impl<P: Providers> AcceptLoop<P> {
    async fn run(
        self,
        listener: <P::Network as NetworkProvider>::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.serve(stream, peer).await,
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
    }

    async fn serve(&self, stream: <P::Network as NetworkProvider>::TcpStream, peer: String) {
        let mut options = ConnectionOptions::inbound(peer.clone(), self.ctx.protocols().clone(), self.ctx.config());
        if let Some(manager) = &self.manager {
            let listener: Weak<dyn ConnectionEventListener> = Arc::downgrade(manager) as Weak<dyn ConnectionEventListener>;
            options = options.with_events(listener);
        }

        let connection = match Connection::spawn(stream, options, self.ctx.providers().task()) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to set up accepted connection");
                return;
            }
        };

        {
            let mut tracked = self.connections.lock();
            tracked.retain(|weak| weak.strong_count() > 0);
            tracked.push(Arc::downgrade(&connection));
        }
        if let Some(manager) = &self.manager {
            manager.add(connection).await;
        }
    }
}
