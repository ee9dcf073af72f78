//! Invocation paths over a single connection: deadlines, timeouts, closing
//! and failed writes.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{ScriptedStream, binary_registry, init_tracing, outbound};
use switchyard_core::{TimeProvider, TokioTaskProvider, TokioTimeProvider};
use switchyard_transport::{
    BINARY_PROTOCOL_CODE, CommandCode, InvokeCallback, Remoting, RemotingCommand, RemotingError,
    ResponseStatus, TimeoutScheduler,
};
use tokio::sync::mpsc;

fn remoting() -> Remoting<TokioTimeProvider> {
    Remoting::new(TokioTimeProvider::new(), TimeoutScheduler::start(&TokioTaskProvider))
}

fn request(id: u32, deadline_millis: u64) -> RemotingCommand {
    RemotingCommand::request(BINARY_PROTOCOL_CODE, CommandCode::new(1), "ping")
        .with_id(id)
        .with_deadline(deadline_millis)
}

fn in_ms(ms: u64) -> u64 {
    TokioTimeProvider::new().now_millis() + ms
}

struct Outcomes(mpsc::UnboundedSender<(&'static str, u32)>);

impl InvokeCallback for Outcomes {
    fn on_complete(&self, response: RemotingCommand) {
        let _ = self.0.send(("complete", response.id));
    }

    fn on_timeout(&self, id: u32) {
        let _ = self.0.send(("timeout", id));
    }
}

#[tokio::test]
async fn test_past_deadline_never_touches_the_transport() {
    init_tracing();
    let (stream, written) = ScriptedStream::sink();
    let (protocols, _rx) = binary_registry();
    let connection = outbound(stream, protocols);
    let remoting = remoting();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let future = remoting.send_future(&connection, request(1, 1), Some(Arc::new(Outcomes(tx))));
    let response = future.try_response().expect("resolved without waiting");
    assert_eq!(response.status, ResponseStatus::Timeout);
    assert_eq!(rx.recv().await, Some(("timeout", 1)));
    assert_eq!(rx.recv().await, Some(("complete", 1)));

    let sync = remoting.send_sync(&connection, request(2, 1)).await;
    assert_eq!(sync.status, ResponseStatus::Timeout);

    let oneway = RemotingCommand::oneway(BINARY_PROTOCOL_CODE, CommandCode::new(1), "x")
        .with_id(3)
        .with_deadline(1);
    assert!(matches!(
        remoting.send_oneway(&connection, oneway),
        Err(RemotingError::DeadlineExceeded { id: 3 })
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(written.load(Ordering::SeqCst), 0);
    assert_eq!(connection.pending_futures(), 0);
}

#[tokio::test]
async fn test_unanswered_request_times_out_and_leaves_no_entry() {
    init_tracing();
    let (local, _peer) = tokio::io::duplex(64 * 1024);
    let (protocols, _rx) = binary_registry();
    let connection = outbound(local, protocols);
    let remoting = remoting();

    let id = connection.next_request_id();
    let started = tokio::time::Instant::now();
    let response = remoting.send_sync(&connection, request(id, in_ms(50))).await;

    assert_eq!(response.status, ResponseStatus::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert!(!connection.contains_future(id));
    assert_eq!(connection.pending_futures(), 0);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_close_resolves_every_outstanding_future() {
    init_tracing();
    let (stream, _written) = ScriptedStream::sink();
    let (protocols, _rx) = binary_registry();
    let connection = outbound(stream, protocols);
    let remoting = remoting();

    let futures: Vec<_> = (0..5)
        .map(|_| {
            let id = connection.next_request_id();
            remoting.send_future(&connection, request(id, in_ms(60_000)), None)
        })
        .collect();

    for _ in 0..100 {
        if connection.pending_futures() == futures.len() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(connection.pending_futures(), futures.len());

    assert!(connection.close());
    assert_eq!(connection.pending_futures(), 0);
    for future in futures {
        let response = tokio::time::timeout(Duration::from_secs(1), future.await_response())
            .await
            .expect("resolved by close");
        assert_eq!(response.status, ResponseStatus::ConnectionClosed);
        assert!(matches!(
            response.into_result(),
            Err(RemotingError::ConnectionClosed)
        ));
    }
}

#[tokio::test]
async fn test_oneway_on_broken_transport_does_not_block() {
    init_tracing();
    let (stream, written) = ScriptedStream::broken();
    let (protocols, _rx) = binary_registry();
    let connection = outbound(stream, protocols);
    let remoting = remoting();

    let oneway = RemotingCommand::oneway(BINARY_PROTOCOL_CODE, CommandCode::new(1), "fire")
        .with_id(connection.next_request_id());
    tokio::time::timeout(Duration::from_secs(1), async {
        remoting.send_oneway(&connection, oneway).expect("failures are not surfaced");
    })
    .await
    .expect("oneway returns immediately");

    for _ in 0..100 {
        if connection.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(connection.is_closed(), "write failure closes the connection");
    assert_eq!(connection.pending_futures(), 0);
    assert_eq!(written.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_request_on_broken_transport_resolves_with_send_failure() {
    init_tracing();
    let (stream, _written) = ScriptedStream::broken();
    let (protocols, _rx) = binary_registry();
    let connection = outbound(stream, protocols);
    let remoting = remoting();

    let id = connection.next_request_id();
    let response = tokio::time::timeout(
        Duration::from_secs(1),
        remoting.send_sync(&connection, request(id, in_ms(60_000))),
    )
    .await
    .expect("resolved before the deadline");

    assert_eq!(response.status, ResponseStatus::SendFailed);
    assert!(!connection.contains_future(id));
}
