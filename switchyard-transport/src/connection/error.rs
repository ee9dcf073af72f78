//! Error types for establishing connections.

use std::time::Duration;

use thiserror::Error;

use crate::wire::DecodeError;

/// Errors raised while dialing or pooling connections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The dial failed.
    #[error("failed to connect to {address}: {message}")]
    Dial {
        /// Address dialed.
        address: String,
        /// Transport diagnostic.
        message: String,
    },

    /// The dial did not complete in time.
    #[error("connecting to {address} timed out after {timeout:?}")]
    Timeout {
        /// Address dialed.
        address: String,
        /// Configured dial timeout.
        timeout: Duration,
    },

    /// The URL names a protocol that is not registered.
    #[error("cannot bind protocol: {0}")]
    Protocol(#[source] DecodeError),

    /// The pool already holds its maximum number of connections.
    #[error("pool {key} is full ({max} connections)")]
    PoolFull {
        /// Pool key.
        key: String,
        /// Configured maximum.
        max: usize,
    },

    /// The manager only tracks inbound connections and cannot dial.
    #[error("connection manager has no connection factory")]
    NoFactory,

    /// The manager has been shut down.
    #[error("connection manager shut down")]
    Shutdown,
}
