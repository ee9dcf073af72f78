//! Top-level error type for remoting operations.
//!
//! Connection-fatal errors ([`RemotingError::Protocol`], [`RemotingError::Decode`])
//! close the connection they occur on. The request-scoped ones reach callers
//! through synthetic response commands, see
//! [`RemotingCommand::into_result`](crate::RemotingCommand::into_result).

use switchyard_core::{CodecError, CommandCode, CompressError};
use thiserror::Error;

use crate::connection::ConnectError;
use crate::wire::{DecodeError, EncodeError};

/// Errors surfaced by the remoting runtime.
#[derive(Debug, Error)]
pub enum RemotingError {
    /// Unknown or mismatched protocol code on a connection.
    #[error("protocol error: {0}")]
    Protocol(#[source] DecodeError),

    /// Malformed frame.
    #[error("decode error: {0}")]
    Decode(#[source] DecodeError),

    /// A frame could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// The request deadline passed before or after sending.
    #[error("deadline exceeded for request {id}")]
    DeadlineExceeded {
        /// Request id.
        id: u32,
    },

    /// The transport failed to write the request.
    #[error("send failed: {message}")]
    SendFailure {
        /// What the transport reported.
        message: String,
    },

    /// Dialing the destination failed.
    #[error("connect failed: {0}")]
    ConnectFailure(#[from] ConnectError),

    /// The remote worker pool rejected the request.
    #[error("dispatch rejected for request {id}")]
    DispatchRejected {
        /// Request id.
        id: u32,
    },

    /// The connection was closed with the request outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote processor failed.
    #[error("server error: {message}")]
    ServerError {
        /// Diagnostic sent back by the remote side.
        message: String,
    },

    /// No processor is registered for the command on the remote side.
    #[error("no processor for command {command}")]
    NoProcessor {
        /// The command that was sent.
        command: CommandCode,
    },

    /// Payload serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Payload compression failed.
    #[error("compression error: {0}")]
    Compress(#[from] CompressError),

    /// The runtime has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl From<DecodeError> for RemotingError {
    fn from(error: DecodeError) -> Self {
        if error.is_protocol_violation() {
            RemotingError::Protocol(error)
        } else {
            RemotingError::Decode(error)
        }
    }
}

impl RemotingError {
    /// Whether the error ends the connection it happened on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, RemotingError::Protocol(_) | RemotingError::Decode(_))
    }
}
