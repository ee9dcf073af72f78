//! Routing decoded commands to processors.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use switchyard_core::{CompressorRegistry, Providers, SerializerRegistry, TimeProvider};

use super::{ProcessContext, ProcessorRegistry, WorkerPool};
use crate::command::{CommandKind, RemotingCommand, ResponseStatus};
use crate::connection::Connection;
use crate::protocol::CommandHandler;

struct DispatchCore<T: TimeProvider> {
    processors: Arc<ProcessorRegistry>,
    serializers: Arc<SerializerRegistry>,
    compressors: Arc<CompressorRegistry>,
    time: T,
}

/// Command handler dispatching to registered processors.
///
/// Each decoded batch is processed in order, either inline on the
/// connection's read loop or, when a worker pool is configured, on a pooled
/// task. A batch the pool rejects is answered with one rejection response
/// per request in it.
pub struct CommandDispatcher<P: Providers> {
    core: Arc<DispatchCore<P::Time>>,
    pool: Option<WorkerPool<P::Task>>,
}

impl<P: Providers> CommandDispatcher<P> {
    /// Dispatcher processing inline.
    pub fn new(
        providers: &P,
        processors: Arc<ProcessorRegistry>,
        serializers: Arc<SerializerRegistry>,
        compressors: Arc<CompressorRegistry>,
    ) -> Self {
        Self {
            core: Arc::new(DispatchCore {
                processors,
                serializers,
                compressors,
                time: providers.time().clone(),
            }),
            pool: None,
        }
    }

    /// Off-load batches to a worker pool of `size` slots.
    pub fn with_worker_pool(mut self, providers: &P, size: usize) -> Self {
        self.pool = Some(WorkerPool::new(providers.task().clone(), size));
        self
    }

    /// The worker pool, if batches are off-loaded.
    pub fn worker_pool(&self) -> Option<&WorkerPool<P::Task>> {
        self.pool.as_ref()
    }
}

#[async_trait]
impl<P: Providers> CommandHandler for CommandDispatcher<P> {
    async fn handle_commands(&self, connection: &Arc<Connection>, commands: Vec<RemotingCommand>) {
        let Some(pool) = &self.pool else {
            self.core.process_batch(connection, commands).await;
            return;
        };

        let core = self.core.clone();
        let conn = connection.clone();
        let submitted = pool.try_submit(commands, move |commands| async move {
            core.process_batch(&conn, commands).await;
        });

        if let Err(commands) = submitted {
            tracing::warn!(
                connection = connection.id(),
                batch = commands.len(),
                "worker pool saturated, rejecting batch"
            );
            for command in commands.iter().filter(|c| c.kind.expects_response()) {
                let response =
                    RemotingCommand::failure_to(command, ResponseStatus::Rejected, "dispatch rejected: worker pool saturated");
                send_response(connection, response);
            }
        }
    }
}

impl<T: TimeProvider> DispatchCore<T> {
    async fn process_batch(&self, connection: &Arc<Connection>, commands: Vec<RemotingCommand>) {
        for command in commands {
            if let Some(response) = self.process_one(connection, command).await {
                send_response(connection, response);
            }
        }
    }

    /// Process one command, returning the response to send, if any.
    async fn process_one(&self, connection: &Arc<Connection>, command: RemotingCommand) -> Option<RemotingCommand> {
        let expects_response = command.kind.expects_response();

        if command.kind == CommandKind::Heartbeat {
            tracing::trace!(connection = connection.id(), id = command.id, "heartbeat received");
            return Some(RemotingCommand::response_to(&command, Bytes::new()));
        }

        let now = self.time.now_millis();
        if command.is_expired(now) {
            tracing::debug!(
                connection = connection.id(),
                id = command.id,
                command = %command.command,
                late_ms = now - command.deadline_millis,
                "request expired before processing"
            );
            return expects_response.then(|| {
                RemotingCommand::failure_to(&command, ResponseStatus::Timeout, "deadline exceeded before processing")
            });
        }

        let Some(processor) = self.processors.get(command.command) else {
            tracing::warn!(
                connection = connection.id(),
                command = %command.command,
                "no processor registered for command"
            );
            return expects_response.then(|| {
                RemotingCommand::failure_to(&command, ResponseStatus::NoProcessor, "no processor for command")
            });
        };

        let ctx = ProcessContext::new(
            connection.clone(),
            self.serializers.clone(),
            self.compressors.clone(),
            now,
        );
        let request = command.clone();
        let outcome = AssertUnwindSafe(processor.process(&ctx, request))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(Some(response))) => stamp(&command, response),
            Ok(Ok(None)) => RemotingCommand::response_to(&command, Bytes::new()),
            Ok(Err(e)) => {
                tracing::error!(
                    connection = connection.id(),
                    id = command.id,
                    command = %command.command,
                    error = %e,
                    "processor failed"
                );
                RemotingCommand::failure_to(&command, ResponseStatus::ServerError, &e.to_string())
            }
            Err(_) => {
                tracing::error!(
                    connection = connection.id(),
                    id = command.id,
                    command = %command.command,
                    "processor panicked"
                );
                RemotingCommand::failure_to(&command, ResponseStatus::ServerError, "processor panicked")
            }
        };
        expects_response.then_some(response)
    }
}

/// Correlate `response` with `request` whatever the processor filled in.
fn stamp(request: &RemotingCommand, mut response: RemotingCommand) -> RemotingCommand {
    response.id = request.id;
    response.kind = CommandKind::Response;
    response.protocol = request.protocol;
    response.command = request.command;
    response.deadline_millis = 0;
    response
}

fn send_response(connection: &Connection, response: RemotingCommand) {
    let id = response.id;
    if let Err(e) = connection.write_detached(response) {
        tracing::debug!(connection = connection.id(), id, error = %e, "dropping response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{FnProcessor, ProcessError, Processor};
    use switchyard_core::{CommandCode, ProtocolCode, TokioProviders};

    const PROTO: ProtocolCode = ProtocolCode::new(0x5359);

    struct Panics;

    #[async_trait]
    impl Processor for Panics {
        async fn process(
            &self,
            _ctx: &ProcessContext,
            _request: RemotingCommand,
        ) -> Result<Option<RemotingCommand>, ProcessError> {
            panic!("processor bug");
        }
    }

    fn core() -> DispatchCore<switchyard_core::TokioTimeProvider> {
        let mut processors = ProcessorRegistry::new();
        processors.register(
            CommandCode::new(1),
            Arc::new(FnProcessor::new(|_ctx, req: RemotingCommand| {
                Ok(Some(RemotingCommand::response_to(&req, req.body.clone())))
            })),
        );
        processors.register(
            CommandCode::new(2),
            Arc::new(FnProcessor::new(|_ctx, _req| Err(ProcessError::failed("boom")))),
        );
        processors.register(CommandCode::new(3), Arc::new(Panics));
        let providers = TokioProviders::new();
        DispatchCore {
            processors: Arc::new(processors),
            serializers: Arc::new(SerializerRegistry::with_defaults()),
            compressors: Arc::new(CompressorRegistry::with_defaults()),
            time: providers.time().clone(),
        }
    }

    #[test]
    fn test_stamp_fixes_correlation_fields() {
        let request = RemotingCommand::request(PROTO, CommandCode::new(1), "x").with_id(11);
        let stray = RemotingCommand::request(ProtocolCode::new(9), CommandCode::new(5), "y").with_id(99);
        let stamped = stamp(&request, stray);
        assert_eq!(stamped.id, 11);
        assert_eq!(stamped.kind, CommandKind::Response);
        assert_eq!(stamped.protocol, PROTO);
        assert_eq!(stamped.command, CommandCode::new(1));
    }

    #[tokio::test]
    async fn test_processor_outcomes_map_to_statuses() {
        let (connection, _peer) = crate::test_support::loose_connection(PROTO);
        let core = core();

        let ok = core
            .process_one(&connection, RemotingCommand::request(PROTO, CommandCode::new(1), "hi").with_id(1))
            .await
            .expect("response");
        assert_eq!(ok.status, ResponseStatus::Success);
        assert_eq!(&ok.body[..], b"hi");

        let failed = core
            .process_one(&connection, RemotingCommand::request(PROTO, CommandCode::new(2), "").with_id(2))
            .await
            .expect("response");
        assert_eq!(failed.status, ResponseStatus::ServerError);
        assert_eq!(failed.message(), "boom");

        let panicked = core
            .process_one(&connection, RemotingCommand::request(PROTO, CommandCode::new(3), "").with_id(3))
            .await
            .expect("response");
        assert_eq!(panicked.status, ResponseStatus::ServerError);

        let missing = core
            .process_one(&connection, RemotingCommand::request(PROTO, CommandCode::new(4), "").with_id(4))
            .await
            .expect("response");
        assert_eq!(missing.status, ResponseStatus::NoProcessor);
    }

    #[tokio::test]
    async fn test_expired_request_is_not_processed() {
        let (connection, _peer) = crate::test_support::loose_connection(PROTO);
        let core = core();
        let request = RemotingCommand::request(PROTO, CommandCode::new(3), "")
            .with_id(5)
            .with_deadline(1);
        let response = core.process_one(&connection, request).await.expect("response");
        assert_eq!(response.status, ResponseStatus::Timeout);
    }

    #[tokio::test]
    async fn test_oneway_gets_no_response() {
        let (connection, _peer) = crate::test_support::loose_connection(PROTO);
        let core = core();
        let oneway = RemotingCommand::oneway(PROTO, CommandCode::new(2), "");
        assert!(core.process_one(&connection, oneway).await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_is_acknowledged() {
        let (connection, _peer) = crate::test_support::loose_connection(PROTO);
        let core = core();
        let heartbeat = RemotingCommand::heartbeat(PROTO, CommandCode::new(0), 7);
        let ack = core.process_one(&connection, heartbeat).await.expect("ack");
        assert_eq!(ack.kind, CommandKind::Response);
        assert_eq!(ack.id, 7);
        assert_eq!(ack.status, ResponseStatus::Success);
    }
}
