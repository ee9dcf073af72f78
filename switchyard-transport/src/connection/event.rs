//! Connection lifecycle events.

use std::sync::Arc;

use super::Connection;

/// Lifecycle transitions reported to a [`ConnectionEventListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// The connection's I/O tasks are running.
    Connected,
    /// The connection failed or the peer went away.
    ///
    /// Not emitted for connections closed locally with
    /// [`Connection::close`].
    Closed,
}

/// Observer of connection lifecycle events.
pub trait ConnectionEventListener: Send + Sync {
    /// Called from the connection's I/O tasks; must not block.
    fn on_event(&self, event: ConnectionEvent, connection: &Arc<Connection>);
}
