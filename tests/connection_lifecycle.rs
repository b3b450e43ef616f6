//! Handshake, disconnect and state-machine behavior against an in-memory
//! broker.

mod common;

use common::{MockBroker, connect_pair, connected, quiet};
use std::time::Duration;
use stomp_wire::{
    AckMode, Command, ConnError, ConnState, ConnectOptions, Connection, Frame, Heartbeat,
    SendOptions, StompItem,
};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn connect_writes_handshake_and_reaches_connected() {
    let (client, server) = tokio::io::duplex(4096);
    let mut broker = MockBroker::new(server);
    let options = ConnectOptions::default()
        .login("guest")
        .passcode("guest")
        .client_id("client-7")
        .heartbeat(Heartbeat::new(0, 0))
        .header("x-tenant", "blue");

    let connecting = tokio::spawn(Connection::connect_stream(client, options));
    let connect = broker
        .accept(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("session", "s-42")
                .header("server", "mock/1.0"),
        )
        .await;
    let conn = connecting.await.unwrap().unwrap();

    assert_eq!(connect.get_header("accept-version"), Some("1.2"));
    assert_eq!(connect.get_header("host"), Some("/"));
    assert_eq!(connect.get_header("login"), Some("guest"));
    assert_eq!(connect.get_header("passcode"), Some("guest"));
    assert_eq!(connect.get_header("heart-beat"), Some("0,0"));
    assert_eq!(connect.get_header("client-id"), Some("client-7"));
    assert_eq!(connect.get_header("x-tenant"), Some("blue"));

    assert_eq!(conn.state(), ConnState::Connected);
    assert_eq!(conn.version(), Some("1.2"));
    assert_eq!(conn.session(), Some("s-42"));
    assert_eq!(conn.server(), Some("mock/1.0"));
}

#[tokio::test]
async fn error_during_connect_is_connect_failed() {
    let (client, server) = tokio::io::duplex(4096);
    let mut broker = MockBroker::new(server);
    let connecting = tokio::spawn(Connection::connect_stream(client, quiet()));

    broker
        .accept(
            Frame::new(Command::Error)
                .header("message", "Authentication failed")
                .set_body(b"bad credentials".to_vec()),
        )
        .await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnError::ConnectFailed(_)), "got {:?}", err);
    let server_err = err.server_error().expect("server error cause");
    assert_eq!(server_err.message, "Authentication failed");
    assert_eq!(server_err.body.as_deref(), Some("bad credentials"));
}

#[tokio::test(start_paused = true)]
async fn missing_connected_times_out() {
    let (client, server) = tokio::io::duplex(4096);
    let mut broker = MockBroker::new(server);
    let options = quiet().connect_timeout(Duration::from_secs(1));

    let started = tokio::time::Instant::now();
    let connecting = tokio::spawn(Connection::connect_stream(client, options));
    let _connect = broker.recv().await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnError::ConnectTimeout(d) if d == Duration::from_secs(1)));
    assert!(started.elapsed() >= Duration::from_secs(1));
    // the client closed its side
    assert!(broker.recv_item().await.is_none());
}

#[tokio::test]
async fn unsupported_version_is_rejected() {
    let (client, server) = tokio::io::duplex(4096);
    let mut broker = MockBroker::new(server);
    let connecting = tokio::spawn(Connection::connect_stream(client, quiet()));
    broker
        .accept(Frame::new(Command::Connected).header("version", "1.0"))
        .await;

    let err = connecting.await.unwrap().unwrap_err();
    match err {
        ConnError::ConnectFailed(cause) => assert!(matches!(*cause, ConnError::Protocol(_))),
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn accept_version_list_allows_older_versions() {
    let options = quiet().accept_version("1.1,1.2");
    let (conn, _broker) = common::connect_pair_with(
        options,
        Frame::new(Command::Connected).header("version", "1.1"),
    )
    .await;
    assert_eq!(conn.version(), Some("1.1"));
}

#[tokio::test]
async fn stream_closed_before_connected_fails_connect() {
    let (client, server) = tokio::io::duplex(4096);
    let mut broker = MockBroker::new(server);
    let connecting = tokio::spawn(Connection::connect_stream(client, quiet()));
    let _connect = broker.recv().await;
    drop(broker);

    let err = connecting.await.unwrap().unwrap_err();
    match err {
        ConnError::ConnectFailed(cause) => assert!(matches!(*cause, ConnError::Io(_))),
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn disconnect_with_receipt_closes_stream() {
    let (conn, mut broker) = connect_pair(quiet()).await;

    let closing = conn.clone();
    let task =
        tokio::spawn(async move { closing.disconnect(Some(Duration::from_secs(5))).await });

    let disconnect = broker.recv().await;
    assert_eq!(disconnect.command, "DISCONNECT");
    broker.receipt_for(&disconnect).await;

    task.await.unwrap().expect("disconnect failed");
    assert_eq!(conn.state(), ConnState::Closed);
    assert!(conn.closed().await.is_ok());
    assert!(broker.recv_item().await.is_none());
}

#[tokio::test]
async fn disconnect_without_timeout_does_not_request_receipt() {
    let (conn, mut broker) = connect_pair(quiet()).await;
    conn.disconnect(None).await.unwrap();

    let disconnect = broker.recv().await;
    assert_eq!(disconnect.command, Command::Disconnect);
    assert!(!disconnect.has_header("receipt"));
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test(start_paused = true)]
async fn disconnect_receipt_timeout_still_closes() {
    let (conn, mut broker) = connect_pair(quiet()).await;

    conn.disconnect(Some(Duration::from_millis(500)))
        .await
        .expect("receipt timeout during disconnect is not an error");
    assert_eq!(conn.state(), ConnState::Closed);
    assert_eq!(broker.recv().await.command, Command::Disconnect);
}

#[tokio::test]
async fn disconnect_twice_is_a_no_op() {
    let (conn, _broker) = connect_pair(quiet()).await;
    conn.disconnect(None).await.unwrap();
    conn.disconnect(None).await.unwrap();
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn error_while_disconnecting_is_ignored() {
    let (conn, mut broker) = connect_pair(quiet()).await;

    let closing = conn.clone();
    let task =
        tokio::spawn(async move { closing.disconnect(Some(Duration::from_secs(5))).await });

    let disconnect = broker.recv().await;
    broker
        .send(Frame::new(Command::Error).header("message", "late error"))
        .await;
    broker.receipt_for(&disconnect).await;

    task.await.unwrap().unwrap();
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn broker_hangup_while_disconnecting_closes_gracefully() {
    let (conn, mut broker) = connect_pair(quiet()).await;

    let closing = conn.clone();
    let task =
        tokio::spawn(async move { closing.disconnect(Some(Duration::from_secs(5))).await });
    let _disconnect = broker.recv().await;
    drop(broker);

    task.await.unwrap().unwrap();
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn write_failure_during_disconnect_closes_gracefully() {
    let (conn, broker) = connect_pair(quiet()).await;

    // nothing yields between the hangup and the DISCONNECT write, so the
    // write fails before the reader sees the end of the stream
    drop(broker);
    conn.disconnect(Some(Duration::from_secs(5)))
        .await
        .expect("broken stream during disconnect is not an error");

    assert_eq!(conn.state(), ConnState::Closed);
    assert!(conn.closed().await.is_ok());
}

#[tokio::test]
async fn operations_after_disconnect_are_already_closed() {
    let (conn, _broker) = connect_pair(quiet()).await;
    conn.disconnect(None).await.unwrap();

    let send = conn.send("/queue/a", "x", SendOptions::default()).await;
    assert!(matches!(send, Err(ConnError::AlreadyClosed)));
    let sub = conn.subscribe("/queue/a", AckMode::Auto).await;
    assert!(matches!(sub, Err(ConnError::AlreadyClosed)));
    let ack = conn.ack("0", "m-1").await;
    assert!(matches!(ack, Err(ConnError::AlreadyClosed)));
}

#[tokio::test]
async fn broker_error_fails_connection() {
    let (conn, mut broker) = connect_pair(quiet()).await;

    broker
        .send(Frame::new(Command::Error).header("message", "queue deleted"))
        .await;

    let err = conn.closed().await.unwrap_err();
    assert_eq!(err.server_error().map(|e| e.message.as_str()), Some("queue deleted"));
    assert_eq!(conn.state(), ConnState::Failed);

    let send = conn.send("/queue/a", "x", SendOptions::default()).await;
    assert!(matches!(send, Err(ConnError::NotConnected)));
    // disconnect after failure does nothing
    conn.disconnect(None).await.unwrap();
    assert_eq!(conn.state(), ConnState::Failed);
}

#[tokio::test]
async fn broker_hangup_fails_connection_with_io_error() {
    let (conn, broker) = connect_pair(quiet()).await;
    drop(broker);

    let err = conn.closed().await.unwrap_err();
    assert!(matches!(err, ConnError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    assert_eq!(conn.state(), ConnState::Failed);
}

#[tokio::test]
async fn malformed_bytes_fail_connection_with_protocol_error() {
    let (client, server) = tokio::io::duplex(4096);
    let connecting = tokio::spawn(Connection::connect_stream(client, quiet()));

    let mut broker = MockBroker::new(server);
    broker.accept(connected()).await;
    let conn = connecting.await.unwrap().unwrap();

    // a header line without a colon
    let mut raw = broker.into_inner();
    raw.write_all(b"MESSAGE\nsubscription 0\n\n\0").await.unwrap();

    let err = conn.closed().await.unwrap_err();
    assert!(matches!(err, ConnError::Protocol(_)), "got {:?}", err);
}

#[tokio::test]
async fn frames_from_broker_are_ignored_when_unexpected() {
    let (conn, mut broker) = connect_pair(quiet()).await;

    broker.send(Frame::new(Command::Receipt).header("receipt-id", "nobody")).await;
    broker.send(common::message("99", "m-1", "orphan")).await;
    broker.send(connected()).await;
    broker.heartbeat().await;

    // still usable: a receipted send round-trips
    let sender = conn.clone();
    let task = tokio::spawn(async move {
        sender
            .send("/queue/a", "ping", SendOptions::default().with_receipt())
            .await
    });
    let send = broker.recv().await;
    broker.receipt_for(&send).await;
    task.await.unwrap().unwrap();
    assert_eq!(conn.state(), ConnState::Connected);
}

#[tokio::test]
async fn negotiated_heartbeats_are_exposed() {
    let options = ConnectOptions::default().heartbeat(Heartbeat::new(1000, 3000));
    let (conn, mut broker) = common::connect_pair_with(
        options,
        Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", "5000,500"),
    )
    .await;
    assert_eq!(
        conn.heartbeat(),
        (Some(Duration::from_millis(1000)), Some(Duration::from_millis(5000)))
    );
    conn.disconnect(None).await.unwrap();
    // drain whatever the client wrote before closing
    while let Some(item) = broker.recv_item().await {
        if let StompItem::Frame(f) = item {
            assert!(matches!(f.command, Command::Disconnect));
        }
    }
}
