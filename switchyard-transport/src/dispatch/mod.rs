//! Server-side command dispatch.
//!
//! Decoded requests are routed by [`CommandCode`] to a [`Processor`]. The
//! [`CommandDispatcher`] is the command handler of a protocol bundle: it
//! answers heartbeats, rejects expired requests, and turns processor failures
//! into error responses so nothing a processor does can take the read loop
//! down.

mod dispatcher;
mod registry;
mod worker;

pub use dispatcher::CommandDispatcher;
pub use registry::ProcessorRegistry;
pub use worker::WorkerPool;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use switchyard_core::{CodecError, CompressError, CompressorRegistry, SerializerRegistry};
use thiserror::Error;

use crate::command::RemotingCommand;
use crate::connection::Connection;
use crate::RemotingError;

/// Failure reported by a processor.
///
/// Sent back to the caller as a server-error response.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Application-level failure.
    #[error("{0}")]
    Failed(String),

    /// The request payload could not be decoded or the reply encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The request payload could not be decompressed.
    #[error(transparent)]
    Compress(#[from] CompressError),

    /// Building the reply failed.
    #[error(transparent)]
    Remoting(#[from] RemotingError),
}

impl ProcessError {
    /// Application failure with `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// What a processor sees besides the request itself.
#[derive(Clone)]
pub struct ProcessContext {
    connection: Arc<Connection>,
    serializers: Arc<SerializerRegistry>,
    compressors: Arc<CompressorRegistry>,
    arrived_at_millis: u64,
}

impl ProcessContext {
    /// Context for a request that arrived on `connection`.
    pub fn new(
        connection: Arc<Connection>,
        serializers: Arc<SerializerRegistry>,
        compressors: Arc<CompressorRegistry>,
        arrived_at_millis: u64,
    ) -> Self {
        Self {
            connection,
            serializers,
            compressors,
            arrived_at_millis,
        }
    }

    /// The connection the request arrived on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Serializers available for payloads.
    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    /// Compressors available for payloads.
    pub fn compressors(&self) -> &CompressorRegistry {
        &self.compressors
    }

    /// Epoch millis at which the request was handed to the dispatcher.
    pub fn arrived_at_millis(&self) -> u64 {
        self.arrived_at_millis
    }

    /// Decode the payload of `request`.
    pub fn decode<T: DeserializeOwned>(&self, request: &RemotingCommand) -> Result<T, ProcessError> {
        Ok(request.payload(&self.serializers, &self.compressors)?)
    }

    /// A successful response to `request` carrying `value`.
    ///
    /// Uses the request's serializer and compressor.
    pub fn reply<T: Serialize>(&self, request: &RemotingCommand, value: &T) -> Result<RemotingCommand, ProcessError> {
        Ok(RemotingCommand::response_to(request, bytes::Bytes::new())
            .with_compressor(request.compressor)
            .with_payload(value, &self.serializers, &self.compressors)?)
    }
}

/// Handles one command code.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process `request`.
    ///
    /// For requests, `Ok(Some(response))` is sent back as is (id and kind are
    /// fixed up) and `Ok(None)` sends an empty success response. For one-way
    /// messages the return value is dropped.
    async fn process(
        &self,
        ctx: &ProcessContext,
        request: RemotingCommand,
    ) -> Result<Option<RemotingCommand>, ProcessError>;
}

/// Convenience processor built from a closure.
pub struct FnProcessor<F>(F);

impl<F> FnProcessor<F>
where
    F: Fn(&ProcessContext, RemotingCommand) -> Result<Option<RemotingCommand>, ProcessError> + Send + Sync,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&ProcessContext, RemotingCommand) -> Result<Option<RemotingCommand>, ProcessError> + Send + Sync,
{
    async fn process(
        &self,
        ctx: &ProcessContext,
        request: RemotingCommand,
    ) -> Result<Option<RemotingCommand>, ProcessError> {
        (self.0)(ctx, request)
    }
}
