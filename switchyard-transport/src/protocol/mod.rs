//! Protocol bundles and their registry.
//!
//! A [`Protocol`] groups everything needed to speak one wire format: an
//! encoder, a decoder, the handler decoded commands are dispatched to, and an
//! optional heartbeat trigger. Bundles are registered under a
//! [`ProtocolCode`]; a connection resolves its bundle once, from the first
//! frame it decodes, and caches it.

mod binary;
mod decoder;
mod registry;

pub use binary::{BINARY_HEARTBEAT_COMMAND, BINARY_PROTOCOL_CODE, BinaryDecoder, BinaryEncoder, BinaryHeartbeatTrigger, BinaryProtocol};
pub use decoder::{ProtocolBinding, ProtocolCodeDecoder};
pub use registry::ProtocolRegistry;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use switchyard_core::ProtocolCode;

use crate::command::RemotingCommand;
use crate::connection::Connection;
use crate::wire::{DecodeError, EncodeError};

/// Turns commands into frame bytes.
pub trait CommandEncoder: Send + Sync {
    /// Append the frame for `command` to `dst`.
    fn encode(&self, command: &RemotingCommand, dst: &mut BytesMut) -> Result<(), EncodeError>;
}

/// Turns frame bytes into commands.
///
/// Same contract as [`FrameDecoder`](crate::wire::FrameDecoder): leave `src`
/// untouched unless a whole frame is present.
pub trait CommandDecoder: Send + Sync {
    /// Decode one command from the front of `src`, if complete.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<RemotingCommand>, DecodeError>;
}

/// Receives decoded non-response commands of a connection.
///
/// Called from the connection's read loop, in arrival order. Responses never
/// reach the handler; they are matched against pending invoke futures first.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle the commands decoded from one arrival.
    async fn handle_commands(&self, connection: &Arc<Connection>, commands: Vec<RemotingCommand>);
}

/// Fires when a connection has been idle for the configured time.
pub trait HeartbeatTrigger: Send + Sync {
    /// Send a heartbeat on `connection`. Must not block.
    fn heartbeat_triggered(&self, connection: &Arc<Connection>);
}

/// Everything needed to speak one protocol.
#[derive(Clone)]
pub struct Protocol {
    code: ProtocolCode,
    encoder: Arc<dyn CommandEncoder>,
    decoder: Arc<dyn CommandDecoder>,
    handler: Arc<dyn CommandHandler>,
    heartbeat: Option<Arc<dyn HeartbeatTrigger>>,
}

impl Protocol {
    /// Bundle an encoder, decoder and handler under `code`.
    pub fn new(
        code: ProtocolCode,
        encoder: Arc<dyn CommandEncoder>,
        decoder: Arc<dyn CommandDecoder>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            code,
            encoder,
            decoder,
            handler,
            heartbeat: None,
        }
    }

    /// Attach a heartbeat trigger.
    pub fn with_heartbeat(mut self, trigger: Arc<dyn HeartbeatTrigger>) -> Self {
        self.heartbeat = Some(trigger);
        self
    }

    /// Code this bundle is registered under.
    pub fn code(&self) -> ProtocolCode {
        self.code
    }

    /// Encoder.
    pub fn encoder(&self) -> &Arc<dyn CommandEncoder> {
        &self.encoder
    }

    /// Decoder.
    pub fn decoder(&self) -> &Arc<dyn CommandDecoder> {
        &self.decoder
    }

    /// Command handler.
    pub fn handler(&self) -> &Arc<dyn CommandHandler> {
        &self.handler
    }

    /// Heartbeat trigger, if the protocol has one.
    pub fn heartbeat(&self) -> Option<&Arc<dyn HeartbeatTrigger>> {
        self.heartbeat.as_ref()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("code", &self.code)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}
