//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use switchyard_transport::{
    BINARY_PROTOCOL_CODE, BinaryProtocol, CommandHandler, Connection, ConnectionOptions,
    ProtocolRegistry, RemotingCommand, TransportConfig, Url,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Install a test subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Stream whose reads never complete and whose writes either succeed
/// silently or fail, counting the bytes accepted.
pub struct ScriptedStream {
    fail_writes: bool,
    written: Arc<AtomicUsize>,
}

impl ScriptedStream {
    /// Stream accepting every write.
    pub fn sink() -> (Self, Arc<AtomicUsize>) {
        let written = Arc::new(AtomicUsize::new(0));
        (
            Self {
                fail_writes: false,
                written: written.clone(),
            },
            written,
        )
    }

    /// Stream failing every write.
    pub fn broken() -> (Self, Arc<AtomicUsize>) {
        let written = Arc::new(AtomicUsize::new(0));
        (
            Self {
                fail_writes: true,
                written: written.clone(),
            },
            written,
        )
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.fail_writes {
            return Poll::Ready(Err(std::io::Error::other("broken pipe")));
        }
        self.written.fetch_add(buf.len(), Ordering::SeqCst);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.fail_writes {
            return Poll::Ready(Err(std::io::Error::other("broken pipe")));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Handler forwarding every command it receives.
pub struct Recording(pub mpsc::UnboundedSender<RemotingCommand>);

#[async_trait]
impl CommandHandler for Recording {
    async fn handle_commands(&self, _connection: &Arc<Connection>, commands: Vec<RemotingCommand>) {
        for command in commands {
            let _ = self.0.send(command);
        }
    }
}

/// Registry holding the binary protocol with a recording handler.
pub fn binary_registry() -> (Arc<ProtocolRegistry>, mpsc::UnboundedReceiver<RemotingCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = ProtocolRegistry::new();
    registry.register(BinaryProtocol::bundle(
        Arc::new(Recording(tx)),
        TransportConfig::default().max_frame_size,
    ));
    (Arc::new(registry), rx)
}

/// Outbound binary-protocol connection over `stream`.
pub fn outbound<S>(stream: S, protocols: Arc<ProtocolRegistry>) -> Arc<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    outbound_to(Url::new("127.0.0.1", 9009, BINARY_PROTOCOL_CODE), stream, protocols)
}

/// Outbound connection to `url` over `stream`.
pub fn outbound_to<S>(url: Url, stream: S, protocols: Arc<ProtocolRegistry>) -> Arc<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let options = ConnectionOptions::outbound(url, protocols, &TransportConfig::default());
    Connection::spawn(stream, options, &switchyard_core::TokioTaskProvider).expect("spawn connection")
}
