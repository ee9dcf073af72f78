//! The built-in binary protocol, framed as described in [`crate::wire`].

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use switchyard_core::{CommandCode, ProtocolCode, TaskProvider};

use super::{CommandDecoder, CommandEncoder, CommandHandler, HeartbeatTrigger, Protocol};
use crate::command::{RemotingCommand, ResponseStatus};
use crate::connection::Connection;
use crate::invoke::InvokeFuture;
use crate::wire::{DecodeError, EncodeError, encode_command, try_decode_command};

/// Code of the built-in binary protocol ("SY").
pub const BINARY_PROTOCOL_CODE: ProtocolCode = ProtocolCode::new(0x5359);

/// Command code carried by heartbeats.
pub const BINARY_HEARTBEAT_COMMAND: CommandCode = CommandCode::new(0);

/// Encoder for the binary frame format.
#[derive(Debug, Clone, Copy)]
pub struct BinaryEncoder {
    max_body: usize,
}

impl BinaryEncoder {
    /// Encoder rejecting bodies above `max_body` bytes.
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl CommandEncoder for BinaryEncoder {
    fn encode(&self, command: &RemotingCommand, dst: &mut BytesMut) -> Result<(), EncodeError> {
        encode_command(command, dst, self.max_body)
    }
}

/// Decoder for the binary frame format.
#[derive(Debug, Clone, Copy)]
pub struct BinaryDecoder {
    max_body: usize,
}

impl BinaryDecoder {
    /// Decoder rejecting bodies above `max_body` bytes.
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl CommandDecoder for BinaryDecoder {
    fn decode(&self, src: &mut BytesMut) -> Result<Option<RemotingCommand>, DecodeError> {
        try_decode_command(src, self.max_body)
    }
}

/// Sends a heartbeat request on idle and closes the connection after too
/// many go unanswered.
#[derive(Clone)]
pub struct BinaryHeartbeatTrigger<T: TaskProvider> {
    tasks: T,
    ack_timeout: Duration,
    max_failures: u32,
}

impl<T: TaskProvider> BinaryHeartbeatTrigger<T> {
    /// Trigger waiting `ack_timeout` per heartbeat and tolerating
    /// `max_failures` consecutive misses.
    pub fn new(tasks: T, ack_timeout: Duration, max_failures: u32) -> Self {
        Self {
            tasks,
            ack_timeout,
            max_failures,
        }
    }
}

impl<T: TaskProvider> HeartbeatTrigger for BinaryHeartbeatTrigger<T> {
    fn heartbeat_triggered(&self, connection: &Arc<Connection>) {
        let failures = connection.heartbeat_failures();
        if failures >= self.max_failures {
            tracing::warn!(
                connection = connection.id(),
                remote = %connection.remote_addr(),
                failures,
                "heartbeat unanswered too many times, closing connection"
            );
            connection.close();
            return;
        }

        let id = connection.next_request_id();
        let heartbeat = RemotingCommand::heartbeat(BINARY_PROTOCOL_CODE, BINARY_HEARTBEAT_COMMAND, id);
        let future = Arc::new(InvokeFuture::new(id, BINARY_PROTOCOL_CODE, BINARY_HEARTBEAT_COMMAND));
        if connection.write_with_future(heartbeat, future.clone()).is_err() {
            return;
        }

        let weak = Arc::downgrade(connection);
        let ack_timeout = self.ack_timeout;
        self.tasks.spawn_task("heartbeat_ack", async move {
            let acked = match future.await_response_timeout(ack_timeout).await {
                Some(response) => response.status == ResponseStatus::Success,
                None => false,
            };
            let Some(connection) = weak.upgrade() else {
                return;
            };
            if acked {
                connection.reset_heartbeat_failures();
            } else {
                connection.remove_future(id);
                future.put_response(RemotingCommand::synthetic(
                    id,
                    BINARY_PROTOCOL_CODE,
                    BINARY_HEARTBEAT_COMMAND,
                    ResponseStatus::Timeout,
                    "heartbeat not acknowledged",
                ));
                let failures = connection.record_heartbeat_failure();
                tracing::debug!(connection = connection.id(), failures, "heartbeat missed");
            }
        });
    }
}

/// Constructors for the binary protocol bundle.
pub struct BinaryProtocol;

impl BinaryProtocol {
    /// Bundle the binary codec with `handler`, without heartbeats.
    pub fn bundle(handler: Arc<dyn CommandHandler>, max_body: usize) -> Protocol {
        Protocol::new(
            BINARY_PROTOCOL_CODE,
            Arc::new(BinaryEncoder::new(max_body)),
            Arc::new(BinaryDecoder::new(max_body)),
            handler,
        )
    }

    /// Bundle the binary codec with `handler` and a heartbeat trigger.
    pub fn bundle_with_heartbeat<T: TaskProvider>(
        handler: Arc<dyn CommandHandler>,
        max_body: usize,
        trigger: BinaryHeartbeatTrigger<T>,
    ) -> Protocol {
        Self::bundle(handler, max_body).with_heartbeat(Arc::new(trigger))
    }
}
