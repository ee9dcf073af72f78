//! # Switchyard Transport Layer
//!
//! Binary RPC transport runtime built on the switchyard providers.
//!
//! This crate provides:
//! - **Wire format**: length-checked binary frames with CRC32C, reassembled
//!   from arbitrary byte chunks by a frame accumulator
//! - **Protocols**: pluggable encoder/decoder/handler bundles multiplexed on
//!   one listener by protocol code
//! - **Connections**: per-destination pools with warm-up, healing and a
//!   background reconnect worker
//! - **Invocation**: request/response correlation with exactly-once
//!   resolution by response, timeout, send failure or close
//! - **Dispatch**: command-code routing to processors, inline or on a
//!   bounded worker pool

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use switchyard_core::{
    CodecError, CommandCode, CompressError, CompressorRegistry, NetworkProvider, ProtocolCode,
    Providers, RandomProvider, SerializerRegistry, TaskProvider, TimeProvider, TokioProviders, Url,
    UrlParseError,
};

// =============================================================================
// Modules
// =============================================================================

/// Client façade.
pub mod client;

/// Command envelope and request ids.
pub mod command;

/// Runtime configuration.
pub mod config;

/// Connections, pools and reconnection.
pub mod connection;

/// Shared runtime state.
pub mod context;

/// Server-side command dispatch.
pub mod dispatch;

/// Error types for remoting operations.
pub mod error;

/// Request/response correlation and timeouts.
pub mod invoke;

/// Protocol bundles and the protocol registry.
pub mod protocol;

/// Server façade.
pub mod server;

/// Binary frame format and frame accumulation.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use client::RemotingClient;
pub use command::{CommandKind, RemotingCommand, RequestIdGenerator, ResponseStatus};
pub use config::TransportConfig;
pub use connection::{
    ConnectError, Connection, ConnectionEvent, ConnectionEventListener, ConnectionFactory,
    ConnectionManager, ConnectionOptions, ConnectionPool, ConnectionSelectStrategy,
    DefaultConnectionFactory, HealOutcome, PoolHealer, RandomSelectStrategy, ReconnectManager,
    ReconnectTask, Reconnector,
};
pub use context::TransportContext;
pub use dispatch::{
    CommandDispatcher, FnProcessor, ProcessContext, ProcessError, Processor, ProcessorRegistry,
    WorkerPool,
};
pub use error::RemotingError;
pub use invoke::{CallbackExecutor, InvokeCallback, InvokeFuture, Remoting, TimeoutScheduler};
pub use protocol::{
    BINARY_HEARTBEAT_COMMAND, BINARY_PROTOCOL_CODE, BinaryProtocol, CommandDecoder,
    CommandEncoder, CommandHandler, HeartbeatTrigger, Protocol, ProtocolRegistry,
};
pub use server::RemotingServer;
pub use wire::{DecodeError, Decoded, EncodeError, FrameAccumulator, FrameDecoder, HEADER_SIZE};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    use crate::{
        BinaryProtocol, CommandHandler, Connection, ConnectionOptions, ProtocolCode,
        ProtocolRegistry, RemotingCommand, TransportConfig, Url,
    };
    use crate::wire::DEFAULT_MAX_BODY_SIZE;

    struct Ignore;

    #[async_trait]
    impl CommandHandler for Ignore {
        async fn handle_commands(&self, _connection: &Arc<Connection>, _commands: Vec<RemotingCommand>) {}
    }

    /// Outbound connection over an in-memory pipe; keep the peer end alive.
    pub(crate) fn loose_connection(code: ProtocolCode) -> (Arc<Connection>, DuplexStream) {
        let registry = ProtocolRegistry::new();
        registry.register(BinaryProtocol::bundle(Arc::new(Ignore), DEFAULT_MAX_BODY_SIZE));
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let url = Url::new("127.0.0.1", 1, code);
        let options = ConnectionOptions::outbound(url, Arc::new(registry), &TransportConfig::default());
        let connection =
            Connection::spawn(local, options, &switchyard_core::TokioTaskProvider).expect("spawn");
        (connection, peer)
    }
}
