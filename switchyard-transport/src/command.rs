//! The command envelope exchanged over connections.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use switchyard_core::{
    CommandCode, CompressorRegistry, ProtocolCode, SERIALIZER_JSON, SerializerRegistry,
};

use crate::RemotingError;

/// What a command is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Expects a response.
    Request,
    /// Fire-and-forget.
    Oneway,
    /// Answers a request with the same id.
    Response,
    /// Liveness probe, answered by the dispatcher itself.
    Heartbeat,
}

impl CommandKind {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            CommandKind::Request => 0,
            CommandKind::Oneway => 1,
            CommandKind::Response => 2,
            CommandKind::Heartbeat => 3,
        }
    }

    /// Parse a wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommandKind::Request),
            1 => Some(CommandKind::Oneway),
            2 => Some(CommandKind::Response),
            3 => Some(CommandKind::Heartbeat),
            _ => None,
        }
    }

    /// Whether the sender waits for an answer.
    pub fn expects_response(self) -> bool {
        matches!(self, CommandKind::Request | CommandKind::Heartbeat)
    }
}

/// Outcome carried by a response.
///
/// Everything but `Success` is produced locally as a synthetic response or by
/// the remote dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// Processed normally.
    Success,
    /// Deadline passed.
    Timeout,
    /// The request could not be written.
    SendFailed,
    /// The connection closed before an answer arrived.
    ConnectionClosed,
    /// The processor failed.
    ServerError,
    /// The worker pool was saturated.
    Rejected,
    /// No processor handles the command.
    NoProcessor,
}

impl ResponseStatus {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            ResponseStatus::Success => 0,
            ResponseStatus::Timeout => 1,
            ResponseStatus::SendFailed => 2,
            ResponseStatus::ConnectionClosed => 3,
            ResponseStatus::ServerError => 4,
            ResponseStatus::Rejected => 5,
            ResponseStatus::NoProcessor => 6,
        }
    }

    /// Parse a wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseStatus::Success),
            1 => Some(ResponseStatus::Timeout),
            2 => Some(ResponseStatus::SendFailed),
            3 => Some(ResponseStatus::ConnectionClosed),
            4 => Some(ResponseStatus::ServerError),
            5 => Some(ResponseStatus::Rejected),
            6 => Some(ResponseStatus::NoProcessor),
            _ => None,
        }
    }
}

/// A request, response, one-way message or heartbeat.
///
/// `id` is scoped to the connection the command travels on and must not be
/// reused there while a future for it is outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotingCommand {
    /// Connection-scoped request id.
    pub id: u32,
    /// Protocol the command is framed with.
    pub protocol: ProtocolCode,
    /// Request, response, one-way or heartbeat.
    pub kind: CommandKind,
    /// Processor selector.
    pub command: CommandCode,
    /// Serializer of the body.
    pub serializer: i8,
    /// Compressor of the body, if compressed.
    pub compressor: Option<i8>,
    /// Response outcome; `Success` on everything but failed responses.
    pub status: ResponseStatus,
    /// Absolute deadline in epoch milliseconds, `0` for none.
    pub deadline_millis: u64,
    /// Opaque payload.
    pub body: Bytes,
}

impl RemotingCommand {
    fn base(protocol: ProtocolCode, kind: CommandKind, command: CommandCode) -> Self {
        Self {
            id: 0,
            protocol,
            kind,
            command,
            serializer: SERIALIZER_JSON,
            compressor: None,
            status: ResponseStatus::Success,
            deadline_millis: 0,
            body: Bytes::new(),
        }
    }

    /// A request expecting a response.
    pub fn request(protocol: ProtocolCode, command: CommandCode, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::base(protocol, CommandKind::Request, command)
        }
    }

    /// A one-way message.
    pub fn oneway(protocol: ProtocolCode, command: CommandCode, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::base(protocol, CommandKind::Oneway, command)
        }
    }

    /// A heartbeat probe.
    pub fn heartbeat(protocol: ProtocolCode, command: CommandCode, id: u32) -> Self {
        Self {
            id,
            ..Self::base(protocol, CommandKind::Heartbeat, command)
        }
    }

    /// A successful response to `request`.
    pub fn response_to(request: &RemotingCommand, body: impl Into<Bytes>) -> Self {
        Self {
            id: request.id,
            serializer: request.serializer,
            body: body.into(),
            ..Self::base(request.protocol, CommandKind::Response, request.command)
        }
    }

    /// A failed response to `request` carrying a UTF-8 diagnostic.
    pub fn failure_to(request: &RemotingCommand, status: ResponseStatus, message: &str) -> Self {
        Self {
            status,
            ..Self::response_to(request, Bytes::copy_from_slice(message.as_bytes()))
        }
    }

    /// A response produced locally rather than received from the peer.
    pub fn synthetic(
        id: u32,
        protocol: ProtocolCode,
        command: CommandCode,
        status: ResponseStatus,
        message: &str,
    ) -> Self {
        Self {
            id,
            status,
            body: Bytes::copy_from_slice(message.as_bytes()),
            ..Self::base(protocol, CommandKind::Response, command)
        }
    }

    /// Set the request id.
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Set the absolute deadline in epoch milliseconds.
    pub fn with_deadline(mut self, deadline_millis: u64) -> Self {
        self.deadline_millis = deadline_millis;
        self
    }

    /// Set the body serializer code.
    pub fn with_serializer(mut self, serializer: i8) -> Self {
        self.serializer = serializer;
        self
    }

    /// Set the body compressor code.
    pub fn with_compressor(mut self, compressor: Option<i8>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Serialize `value` into the body with this command's serializer and
    /// compressor.
    pub fn with_payload<T: Serialize>(
        mut self,
        value: &T,
        serializers: &SerializerRegistry,
        compressors: &CompressorRegistry,
    ) -> Result<Self, RemotingError> {
        let raw = serializers.serialize(self.serializer, value)?;
        let body = match self.compressor {
            Some(code) => compressors.compress(code, &raw)?,
            None => raw,
        };
        self.body = Bytes::from(body);
        Ok(self)
    }

    /// Deserialize the body with this command's serializer and compressor.
    pub fn payload<T: DeserializeOwned>(
        &self,
        serializers: &SerializerRegistry,
        compressors: &CompressorRegistry,
    ) -> Result<T, RemotingError> {
        match self.compressor {
            Some(code) => {
                let raw = compressors.decompress(code, &self.body)?;
                Ok(serializers.deserialize(self.serializer, &raw)?)
            }
            None => Ok(serializers.deserialize(self.serializer, &self.body)?),
        }
    }

    /// Whether the deadline has passed at `now_millis`.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.deadline_millis != 0 && now_millis >= self.deadline_millis
    }

    /// Body as text, for diagnostics carried by failed responses.
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a failed response into the matching [`RemotingError`].
    pub fn into_result(self) -> Result<RemotingCommand, RemotingError> {
        match self.status {
            ResponseStatus::Success => Ok(self),
            ResponseStatus::Timeout => Err(RemotingError::DeadlineExceeded { id: self.id }),
            ResponseStatus::SendFailed => Err(RemotingError::SendFailure {
                message: self.message(),
            }),
            ResponseStatus::ConnectionClosed => Err(RemotingError::ConnectionClosed),
            ResponseStatus::ServerError => Err(RemotingError::ServerError {
                message: self.message(),
            }),
            ResponseStatus::Rejected => Err(RemotingError::DispatchRejected { id: self.id }),
            ResponseStatus::NoProcessor => Err(RemotingError::NoProcessor {
                command: self.command,
            }),
        }
    }
}

/// Hands out connection-unique request ids.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicU32,
}

impl RequestIdGenerator {
    /// Start at id 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Next id. Wraps around after `u32::MAX`, skipping 0.
    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}
