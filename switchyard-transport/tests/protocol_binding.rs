//! Protocol binding on inbound connections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use common::{Recording, init_tracing};
use switchyard_transport::protocol::{BinaryDecoder, BinaryEncoder};
use switchyard_transport::wire::encode_command;
use switchyard_transport::{
    BINARY_PROTOCOL_CODE, BinaryProtocol, CommandCode, Connection, ConnectionEvent,
    ConnectionEventListener, ConnectionOptions, Protocol, ProtocolCode, ProtocolRegistry,
    RemotingCommand, TransportConfig,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const OTHER_PROTOCOL: ProtocolCode = ProtocolCode::new(0x4242);

struct Events(mpsc::UnboundedSender<ConnectionEvent>);

impl ConnectionEventListener for Events {
    fn on_event(&self, event: ConnectionEvent, _connection: &Arc<Connection>) {
        let _ = self.0.send(event);
    }
}

fn frame(protocol: ProtocolCode, id: u32) -> BytesMut {
    let command = RemotingCommand::oneway(protocol, CommandCode::new(1), "payload").with_id(id);
    let mut buf = BytesMut::new();
    encode_command(&command, &mut buf, 1024).expect("encode");
    buf
}

#[tokio::test]
async fn test_second_protocol_on_bound_connection_fails_it() {
    init_tracing();
    let config = TransportConfig::default();
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let registry = ProtocolRegistry::new();
    registry.register(BinaryProtocol::bundle(
        Arc::new(Recording(commands_tx.clone())),
        config.max_frame_size,
    ));
    registry.register(Protocol::new(
        OTHER_PROTOCOL,
        Arc::new(BinaryEncoder::new(config.max_frame_size)),
        Arc::new(BinaryDecoder::new(config.max_frame_size)),
        Arc::new(Recording(commands_tx)),
    ));

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let listener = Arc::new(Events(events_tx));
    let weak: std::sync::Weak<dyn ConnectionEventListener> =
        Arc::downgrade(&listener) as std::sync::Weak<dyn ConnectionEventListener>;

    let (local, mut peer) = tokio::io::duplex(64 * 1024);
    let options = ConnectionOptions::inbound("peer:1", Arc::new(registry), &config).with_events(weak);
    let connection =
        Connection::spawn(local, options, &switchyard_core::TokioTaskProvider).expect("spawn");
    assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));
    assert_eq!(connection.protocol_code(), None);

    peer.write_all(&frame(BINARY_PROTOCOL_CODE, 1)).await.expect("write");
    let first = tokio::time::timeout(Duration::from_secs(1), commands.recv())
        .await
        .expect("dispatched")
        .expect("command");
    assert_eq!(first.id, 1);
    assert_eq!(connection.protocol_code(), Some(BINARY_PROTOCOL_CODE));

    peer.write_all(&frame(OTHER_PROTOCOL, 2)).await.expect("write");
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("closed in time");
    assert_eq!(event, Some(ConnectionEvent::Closed));
    assert!(connection.is_closed());
    assert!(commands.try_recv().is_err(), "mismatched frame must not be dispatched");
}

#[tokio::test]
async fn test_unknown_protocol_fails_unbound_connection() {
    init_tracing();
    let config = TransportConfig::default();
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let registry = ProtocolRegistry::new();
    registry.register(BinaryProtocol::bundle(Arc::new(Recording(commands_tx)), config.max_frame_size));

    let (local, mut peer) = tokio::io::duplex(64 * 1024);
    let options = ConnectionOptions::inbound("peer:2", Arc::new(registry), &config);
    let connection =
        Connection::spawn(local, options, &switchyard_core::TokioTaskProvider).expect("spawn");

    peer.write_all(&frame(OTHER_PROTOCOL, 1)).await.expect("write");
    for _ in 0..100 {
        if connection.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(connection.is_closed());
    assert!(commands.try_recv().is_err());
}

#[tokio::test]
async fn test_frames_split_across_writes_are_reassembled_in_order() {
    init_tracing();
    let config = TransportConfig::default();
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let registry = ProtocolRegistry::new();
    registry.register(BinaryProtocol::bundle(Arc::new(Recording(commands_tx)), config.max_frame_size));

    let (local, mut peer) = tokio::io::duplex(64 * 1024);
    let options = ConnectionOptions::inbound("peer:3", Arc::new(registry), &config);
    let _connection =
        Connection::spawn(local, options, &switchyard_core::TokioTaskProvider).expect("spawn");

    let mut bytes = BytesMut::new();
    for id in 1..=20 {
        bytes.extend_from_slice(&frame(BINARY_PROTOCOL_CODE, id));
    }
    for chunk in bytes.chunks(7) {
        peer.write_all(chunk).await.expect("write");
        tokio::task::yield_now().await;
    }

    for expected in 1..=20 {
        let command = tokio::time::timeout(Duration::from_secs(1), commands.recv())
            .await
            .expect("dispatched")
            .expect("command");
        assert_eq!(command.id, expected);
    }
}

#[tokio::test]
async fn test_frame_ahead_of_mismatch_in_same_write_is_dispatched() {
    init_tracing();
    let config = TransportConfig::default();
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let registry = ProtocolRegistry::new();
    registry.register(BinaryProtocol::bundle(
        Arc::new(Recording(commands_tx.clone())),
        config.max_frame_size,
    ));
    registry.register(Protocol::new(
        OTHER_PROTOCOL,
        Arc::new(BinaryEncoder::new(config.max_frame_size)),
        Arc::new(BinaryDecoder::new(config.max_frame_size)),
        Arc::new(Recording(commands_tx)),
    ));

    let (local, mut peer) = tokio::io::duplex(64 * 1024);
    let options = ConnectionOptions::inbound("peer:4", Arc::new(registry), &config);
    let connection =
        Connection::spawn(local, options, &switchyard_core::TokioTaskProvider).expect("spawn");

    let mut bytes = frame(BINARY_PROTOCOL_CODE, 1);
    bytes.extend_from_slice(&frame(OTHER_PROTOCOL, 2));
    peer.write_all(&bytes).await.expect("write");

    let first = tokio::time::timeout(Duration::from_secs(1), commands.recv())
        .await
        .expect("dispatched")
        .expect("command");
    assert_eq!(first.id, 1);

    for _ in 0..100 {
        if connection.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(connection.is_closed());
    assert!(commands.try_recv().is_err(), "mismatched frame must not be dispatched");
}
