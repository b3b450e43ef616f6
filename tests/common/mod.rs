//! In-memory broker double shared by the integration tests.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use stomp_wire::{Command, ConnectOptions, Connection, Frame, Heartbeat, StompCodec, StompItem};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

pub struct MockBroker {
    framed: Framed<DuplexStream, StompCodec>,
}

impl MockBroker {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, StompCodec::new()),
        }
    }

    /// The raw stream, for writing bytes the codec would never produce.
    pub fn into_inner(self) -> DuplexStream {
        self.framed.into_inner()
    }

    /// Next item from the client, `None` once the client closed its side.
    pub async fn recv_item(&mut self) -> Option<StompItem> {
        match self.framed.next().await {
            Some(Ok(item)) => Some(item),
            Some(Err(e)) => panic!("broker failed to decode client bytes: {}", e),
            None => None,
        }
    }

    /// Next frame from the client, skipping heartbeats.
    pub async fn recv(&mut self) -> Frame {
        loop {
            match self.recv_item().await {
                Some(StompItem::Frame(f)) => return f,
                Some(StompItem::Heartbeat) => continue,
                None => panic!("client closed the stream while broker expected a frame"),
            }
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed
            .send(StompItem::Frame(frame))
            .await
            .expect("broker write failed");
    }

    pub async fn heartbeat(&mut self) {
        self.framed
            .send(StompItem::Heartbeat)
            .await
            .expect("broker write failed");
    }

    /// Answer the `receipt` header of `frame`.
    pub async fn receipt_for(&mut self, frame: &Frame) {
        let id = frame
            .get_header("receipt")
            .expect("frame carries no receipt header")
            .to_string();
        self.send(Frame::new(Command::Receipt).header("receipt-id", id))
            .await;
    }

    /// Read CONNECT and reply with `reply`. Returns the CONNECT frame.
    pub async fn accept(&mut self, reply: Frame) -> Frame {
        let connect = self.recv().await;
        assert_eq!(connect.command, Command::Connect);
        self.send(reply).await;
        connect
    }
}

pub fn connected() -> Frame {
    Frame::new(Command::Connected)
        .header("version", "1.2")
        .header("heart-beat", "0,0")
}

pub fn message(subscription: &str, message_id: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .header("subscription", subscription)
        .header("message-id", message_id)
        .header("destination", "/queue/test")
        .set_body(body.as_bytes().to_vec())
}

/// Options with heartbeats disabled so timers stay out of the way.
pub fn quiet() -> ConnectOptions {
    ConnectOptions::default().heartbeat(Heartbeat::disabled())
}

/// A connected client and the broker end of its stream.
pub async fn connect_pair(options: ConnectOptions) -> (Connection, MockBroker) {
    connect_pair_with(options, connected()).await
}

pub async fn connect_pair_with(options: ConnectOptions, reply: Frame) -> (Connection, MockBroker) {
    connect_pair_buffered(options, reply, 64 * 1024).await
}

/// Like `connect_pair_with`, with `buffer` bytes of room in each direction.
pub async fn connect_pair_buffered(
    options: ConnectOptions,
    reply: Frame,
    buffer: usize,
) -> (Connection, MockBroker) {
    let (client, server) = tokio::io::duplex(buffer);
    let mut broker = MockBroker::new(server);
    let connecting = tokio::spawn(Connection::connect_stream(client, options));
    broker.accept(reply).await;
    let conn = connecting
        .await
        .expect("connect task panicked")
        .expect("connect failed");
    (conn, broker)
}
