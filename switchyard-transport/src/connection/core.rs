//! A single transport connection.
//!
//! Each connection runs two tasks over the split stream:
//!
//! - the **writer** drains a queue of outbound commands, encodes them with the
//!   bound protocol and writes-and-flushes each one, reporting completion
//! - the **reader** feeds arrivals through a [`FrameAccumulator`], completes
//!   pending futures with responses and hands everything else to the bound
//!   protocol's command handler, in arrival order
//!
//! Keeping them apart lets handlers write responses without waiting on their
//! own read loop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use switchyard_core::{ProtocolCode, TaskProvider, Url};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use super::{ConnectError, ConnectionEvent, ConnectionEventListener};
use crate::command::{CommandKind, RemotingCommand, RequestIdGenerator, ResponseStatus};
use crate::config::TransportConfig;
use crate::invoke::InvokeFuture;
use crate::protocol::{Protocol, ProtocolBinding, ProtocolCodeDecoder, ProtocolRegistry};
use crate::wire::{DecodeError, EncodeError, FrameAccumulator};
use crate::RemotingError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How a connection is set up.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Destination of an outbound connection; `None` for accepted ones.
    pub url: Option<Url>,
    /// Peer address, for logs and inbound pool keys.
    pub remote_addr: String,
    /// Registry the connection resolves its protocol from.
    pub protocols: Arc<ProtocolRegistry>,
    /// Read inactivity before the heartbeat trigger fires; `None` disables it.
    pub idle_time: Option<Duration>,
    /// Bytes read per wake-up.
    pub read_buffer_size: usize,
    /// Receiver of lifecycle events.
    pub events: Option<Weak<dyn ConnectionEventListener>>,
}

impl ConnectionOptions {
    /// Options for a dialed connection to `url`.
    pub fn outbound(url: Url, protocols: Arc<ProtocolRegistry>, config: &TransportConfig) -> Self {
        Self {
            remote_addr: url.address(),
            url: Some(url),
            protocols,
            idle_time: config.idle_heartbeat.then_some(config.idle_time),
            read_buffer_size: config.read_buffer_size,
            events: None,
        }
    }

    /// Options for an accepted connection from `remote_addr`.
    pub fn inbound(
        remote_addr: impl Into<String>,
        protocols: Arc<ProtocolRegistry>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            url: None,
            remote_addr: remote_addr.into(),
            protocols,
            idle_time: None,
            read_buffer_size: config.read_buffer_size,
            events: None,
        }
    }

    /// Report lifecycle events to `listener`.
    pub fn with_events(mut self, listener: Weak<dyn ConnectionEventListener>) -> Self {
        self.events = Some(listener);
        self
    }
}

struct WriteRequest {
    command: RemotingCommand,
    future: Option<Arc<InvokeFuture>>,
    done: Option<oneshot::Sender<Result<(), RemotingError>>>,
}

impl WriteRequest {
    fn notify(self, result: Result<(), RemotingError>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

/// One transport connection.
pub struct Connection {
    id: u64,
    url: Option<Url>,
    pool_key: String,
    remote_addr: String,
    binding: ProtocolBinding,
    protocols: Arc<ProtocolRegistry>,
    futures: DashMap<u32, Arc<InvokeFuture>>,
    ids: RequestIdGenerator,
    closed: AtomicBool,
    writes: mpsc::UnboundedSender<WriteRequest>,
    shutdown: watch::Sender<bool>,
    heartbeat_failures: AtomicU32,
    events: Option<Weak<dyn ConnectionEventListener>>,
}

impl Connection {
    /// Wrap `stream` and start its I/O tasks.
    ///
    /// Outbound connections bind the URL's protocol up front; inbound ones
    /// bind from their first frame.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::Protocol` if the URL's protocol is not registered.
    pub fn spawn<S, T>(stream: S, options: ConnectionOptions, tasks: &T) -> Result<Arc<Self>, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: TaskProvider,
    {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool_key = match &options.url {
            Some(url) => url.pool_key(),
            None => options.remote_addr.clone(),
        };

        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            url: options.url,
            pool_key,
            remote_addr: options.remote_addr,
            binding: ProtocolBinding::new(),
            protocols: options.protocols,
            futures: DashMap::new(),
            ids: RequestIdGenerator::new(),
            closed: AtomicBool::new(false),
            writes: write_tx,
            shutdown: shutdown_tx,
            heartbeat_failures: AtomicU32::new(0),
            events: options.events,
        });

        if let Some(url) = &connection.url {
            connection
                .binding
                .bind(url.protocol(), &connection.protocols)
                .map_err(ConnectError::Protocol)?;
        }

        let (reader, writer) = tokio::io::split(stream);
        tasks.spawn_task(
            "connection_writer",
            write_loop(connection.clone(), writer, write_rx, shutdown_rx.clone()),
        );
        tasks.spawn_task(
            "connection_reader",
            read_loop(
                connection.clone(),
                reader,
                shutdown_rx,
                options.idle_time,
                options.read_buffer_size,
            ),
        );

        tracing::info!(
            connection = connection.id,
            remote = %connection.remote_addr,
            pool = %connection.pool_key,
            "connection opened"
        );
        connection.emit(ConnectionEvent::Connected);
        Ok(connection)
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Destination URL of an outbound connection.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Key of the pool this connection belongs to.
    pub fn pool_key(&self) -> &str {
        &self.pool_key
    }

    /// Peer address.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Bound protocol code, if any frame has bound one yet.
    pub fn protocol_code(&self) -> Option<ProtocolCode> {
        self.binding.code()
    }

    /// Bound protocol bundle.
    pub fn protocol(&self) -> Option<Arc<Protocol>> {
        self.binding.protocol().cloned()
    }

    /// Bind `code` explicitly, with the same rules as a first frame.
    pub fn bind_protocol(&self, code: ProtocolCode) -> Result<(), DecodeError> {
        self.binding.bind(code, &self.protocols).map(|_| ())
    }

    /// Allocate a request id unique on this connection.
    pub fn next_request_id(&self) -> u32 {
        self.ids.next_id()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection.
    ///
    /// Only the first call has an effect: it stops the I/O tasks and resolves
    /// every pending future with a connection-closed response. Returns whether
    /// this call closed the connection.
    pub fn close(&self) -> bool {
        self.shutdown_with("closed locally")
    }

    fn shutdown_with(&self, reason: &str) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let _ = self.shutdown.send(true);

        let ids: Vec<u32> = self.futures.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, future)) = self.futures.remove(&id) {
                future.fail(ResponseStatus::ConnectionClosed, "connection closed");
            }
        }

        tracing::info!(
            connection = self.id,
            remote = %self.remote_addr,
            reason,
            "connection closed"
        );
        true
    }

    /// Close after a transport or protocol failure and report it.
    fn fail(self: &Arc<Self>, reason: &str) {
        if self.shutdown_with(reason) {
            self.emit(ConnectionEvent::Closed);
        }
    }

    fn emit(self: &Arc<Self>, event: ConnectionEvent) {
        if let Some(listener) = self.events.as_ref().and_then(Weak::upgrade) {
            listener.on_event(event, self);
        }
    }

    fn enqueue(&self, request: WriteRequest) -> Result<(), RemotingError> {
        if self.is_closed() {
            return Err(RemotingError::ConnectionClosed);
        }
        self.writes
            .send(request)
            .map_err(|_| RemotingError::ConnectionClosed)
    }

    /// Write `command` and wait for the flush to complete.
    pub async fn write(&self, command: RemotingCommand) -> Result<(), RemotingError> {
        let (done, completion) = oneshot::channel();
        self.enqueue(WriteRequest {
            command,
            future: None,
            done: Some(done),
        })?;
        completion.await.map_err(|_| RemotingError::ConnectionClosed)?
    }

    /// Queue `command` for writing without waiting. Write failures are logged.
    pub fn write_detached(&self, command: RemotingCommand) -> Result<(), RemotingError> {
        self.enqueue(WriteRequest {
            command,
            future: None,
            done: None,
        })
    }

    /// Queue `command` and track `future` for its response.
    ///
    /// The future sits in the table while the write is in flight. If the
    /// write fails it is taken out again and resolved with a send-failed
    /// response; if the connection is already closed it is resolved with a
    /// connection-closed response.
    pub fn write_with_future(
        &self,
        command: RemotingCommand,
        future: Arc<InvokeFuture>,
    ) -> Result<(), RemotingError> {
        let request = WriteRequest {
            command,
            future: Some(future.clone()),
            done: None,
        };
        match self.enqueue(request) {
            Ok(()) => Ok(()),
            Err(e) => {
                future.fail(ResponseStatus::ConnectionClosed, "connection closed");
                Err(e)
            }
        }
    }

    /// Track `future` under its request id.
    ///
    /// A future that is already resolved, or arrives after the connection
    /// closed, does not stay in the table.
    pub fn add_future(&self, future: Arc<InvokeFuture>) {
        let id = future.id();
        self.futures.insert(id, future.clone());
        if future.is_done() || self.is_closed() {
            if self.remove_future_matching(id, &future) {
                future.fail(ResponseStatus::ConnectionClosed, "connection closed");
            }
        }
    }

    /// Take the future for `id` out of the table.
    pub fn remove_future(&self, id: u32) -> Option<Arc<InvokeFuture>> {
        self.futures.remove(&id).map(|(_, future)| future)
    }

    /// Remove the entry for `id` only if it is `future`.
    pub fn remove_future_matching(&self, id: u32, future: &Arc<InvokeFuture>) -> bool {
        self.futures
            .remove_if(&id, |_, current| Arc::ptr_eq(current, future))
            .is_some()
    }

    /// Whether a future is pending for `id`.
    pub fn contains_future(&self, id: u32) -> bool {
        self.futures.contains_key(&id)
    }

    /// Number of pending futures.
    pub fn pending_futures(&self) -> usize {
        self.futures.len()
    }

    /// Consecutive unanswered heartbeats.
    pub fn heartbeat_failures(&self) -> u32 {
        self.heartbeat_failures.load(Ordering::Relaxed)
    }

    /// Count one more unanswered heartbeat, returning the new total.
    pub fn record_heartbeat_failure(&self) -> u32 {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reset the unanswered heartbeat count.
    pub fn reset_heartbeat_failures(&self) {
        self.heartbeat_failures.store(0, Ordering::Relaxed);
    }

    fn encode(&self, command: &RemotingCommand, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let protocol = match self.binding.protocol() {
            Some(bound) if bound.code() == command.protocol => bound.clone(),
            _ => self
                .protocols
                .resolve(command.protocol)
                .ok_or(EncodeError::UnknownProtocol {
                    code: command.protocol,
                })?,
        };
        protocol.encoder().encode(command, dst)
    }

    fn complete_future(&self, response: RemotingCommand) {
        match self.remove_future(response.id) {
            Some(future) => {
                future.complete(response);
            }
            None => tracing::warn!(
                connection = self.id,
                id = response.id,
                "no pending future for response, request already timed out or unknown"
            ),
        }
    }

    fn on_idle(self: &Arc<Self>) {
        let trigger = self.binding.protocol().and_then(|p| p.heartbeat()).cloned();
        if let Some(trigger) = trigger {
            tracing::debug!(connection = self.id, "connection idle, triggering heartbeat");
            trigger.heartbeat_triggered(self);
        }
    }

    /// Route decoded frames: responses to their futures, the rest to the
    /// protocol's handler.
    async fn dispatch(self: &Arc<Self>, frames: Vec<RemotingCommand>) {
        if frames.is_empty() {
            return;
        }
        let mut commands = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.kind == CommandKind::Response {
                self.complete_future(frame);
            } else {
                commands.push(frame);
            }
        }
        if commands.is_empty() {
            return;
        }
        match self.protocol() {
            Some(protocol) => protocol.handler().handle_commands(self, commands).await,
            None => tracing::warn!(connection = self.id, "commands decoded on an unbound connection"),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool_key", &self.pool_key)
            .field("remote_addr", &self.remote_addr)
            .field("protocol", &self.binding.code())
            .field("closed", &self.is_closed())
            .field("pending_futures", &self.futures.len())
            .finish()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    connection: Arc<Connection>,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<WriteRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if connection.is_closed() {
            fail_request(&connection, request, RemotingError::ConnectionClosed);
            continue;
        }

        let id = request.command.id;
        if let Some(future) = &request.future {
            connection.add_future(future.clone());
        }

        buffer.clear();
        let result = match connection.encode(&request.command, &mut buffer) {
            Ok(()) => write_and_flush(&mut writer, &buffer)
                .await
                .map_err(|e| RemotingError::SendFailure {
                    message: e.to_string(),
                }),
            Err(e) => Err(RemotingError::from(e)),
        };

        match result {
            Ok(()) => request.notify(Ok(())),
            Err(error) => {
                let transport_failed = matches!(error, RemotingError::SendFailure { .. });
                tracing::warn!(
                    connection = connection.id,
                    id,
                    kind = ?request.command.kind,
                    error = %error,
                    "failed to write command"
                );
                fail_request(&connection, request, error);
                if transport_failed {
                    connection.fail("write failed");
                    break;
                }
            }
        }
    }

    queue.close();
    while let Ok(request) = queue.try_recv() {
        fail_request(&connection, request, RemotingError::ConnectionClosed);
    }
    let _ = writer.shutdown().await;
}

fn fail_request(connection: &Connection, request: WriteRequest, error: RemotingError) {
    if let Some(future) = &request.future {
        connection.remove_future_matching(request.command.id, future);
        let status = match error {
            RemotingError::ConnectionClosed => ResponseStatus::ConnectionClosed,
            _ => ResponseStatus::SendFailed,
        };
        future.fail(status, &error.to_string());
    }
    request.notify(Err(error));
}

async fn write_and_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_loop<R: AsyncRead + Unpin>(
    connection: Arc<Connection>,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
    idle_time: Option<Duration>,
    chunk_size: usize,
) {
    let mut accumulator = FrameAccumulator::new();
    let mut chunk = vec![0u8; chunk_size.max(1)];

    let failure: Option<String> = loop {
        let idle = async {
            match idle_time {
                Some(idle) => tokio::time::sleep(idle).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break None,
            _ = idle => connection.on_idle(),
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break Some("peer closed the connection".to_string()),
                Ok(n) => {
                    let decoded = {
                        let mut decoder =
                            ProtocolCodeDecoder::new(&connection.protocols, &connection.binding);
                        accumulator.decode(&chunk[..n], &mut decoder)
                    };
                    connection.dispatch(decoded.frames).await;
                    if let Some(e) = decoded.error {
                        let error = RemotingError::from(e);
                        tracing::warn!(
                            connection = connection.id,
                            remote = %connection.remote_addr,
                            error = %error,
                            "closing connection on undecodable input"
                        );
                        accumulator.discard();
                        break Some(error.to_string());
                    }
                }
                Err(e) => break Some(format!("read failed: {}", e)),
            },
        }
    };

    let Some(reason) = failure else {
        // closed locally; pending futures are already resolved
        accumulator.discard();
        return;
    };

    let tail = {
        let mut decoder = ProtocolCodeDecoder::new(&connection.protocols, &connection.binding);
        accumulator.finish(&mut decoder)
    };
    connection.dispatch(tail).await;
    connection.fail(&reason);
}
