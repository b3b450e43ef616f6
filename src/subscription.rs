use futures::Stream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::ConnError;
use crate::frame::Frame;

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    /// Value of the SUBSCRIBE `ack` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(format!("unknown ack mode '{}'", other)),
        }
    }
}

/// Extra settings for a SUBSCRIBE.
///
/// `headers` are forwarded to the broker verbatim (e.g. `selector`,
/// `activemq.prefetchSize`). If `durable_queue` is set it is used as the
/// destination instead of the one passed to `subscribe_with_options`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub headers: Vec<(String, String)>,
    pub durable_queue: Option<String>,
}

impl SubscriptionOptions {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn durable_queue(mut self, queue: impl Into<String>) -> Self {
        self.durable_queue = Some(queue.into());
        self
    }
}

/// Receives the MESSAGE frames of one subscription.
///
/// Called from the connection's reader task: a slow handler delays every
/// other subscription on the same connection.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, frame: Frame);
}

impl<F> MessageHandler for F
where
    F: Fn(Frame) + Send + Sync + 'static,
{
    fn on_message(&self, frame: Frame) {
        self(frame)
    }
}

/// Forwards frames into the channel behind a `Subscription` stream.
struct ChannelHandler(mpsc::UnboundedSender<Frame>);

impl MessageHandler for ChannelHandler {
    fn on_message(&self, frame: Frame) {
        // receiver gone means the application dropped the stream
        let _ = self.0.send(frame);
    }
}

struct Entry {
    destination: String,
    ack: AckMode,
    // None once removed; delivery checks it under this lock
    handler: Mutex<Option<Box<dyn MessageHandler>>>,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    entries: HashMap<String, Arc<Entry>>,
    closed: Option<ConnError>,
}

/// Active subscriptions of one connection, keyed by subscription id.
///
/// The table lock is only held to look up, insert or remove an entry;
/// handlers run under the entry's own lock so that `remove` returning
/// guarantees no further delivery for that id.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    table: Mutex<Table>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and register `handler` under it.
    pub(crate) fn register(
        &self,
        destination: &str,
        ack: AckMode,
        handler: Box<dyn MessageHandler>,
    ) -> Result<String, ConnError> {
        let mut table = relock(&self.table);
        if let Some(err) = &table.closed {
            return Err(err.clone());
        }
        let id = table.next_id.to_string();
        table.next_id += 1;
        table.entries.insert(
            id.clone(),
            Arc::new(Entry {
                destination: destination.to_string(),
                ack,
                handler: Mutex::new(Some(handler)),
            }),
        );
        Ok(id)
    }

    /// Deliver `frame` to the handler registered under `id`.
    ///
    /// Returns `false` when no such subscription exists (the frame is
    /// dropped).
    pub(crate) fn dispatch(&self, id: &str, frame: Frame) -> bool {
        let Some(entry) = relock(&self.table).entries.get(id).cloned() else {
            return false;
        };
        let handler = relock(&entry.handler);
        match handler.as_ref() {
            Some(h) => {
                h.on_message(frame);
                true
            }
            None => false,
        }
    }

    /// Remove the subscription. Once this returns no handler call for `id`
    /// is in progress and none will start.
    pub(crate) fn remove(&self, id: &str) -> bool {
        let Some(entry) = relock(&self.table).entries.remove(id) else {
            return false;
        };
        relock(&entry.handler).take();
        true
    }

    /// Drop every subscription and refuse new ones with `err`.
    pub(crate) fn clear(&self, err: ConnError) {
        let drained: Vec<_> = {
            let mut table = relock(&self.table);
            table.closed.get_or_insert(err);
            table.entries.drain().collect()
        };
        for (id, entry) in drained {
            tracing::trace!(subscription = %id, destination = %entry.destination, "dropping subscription");
            relock(&entry.handler).take();
        }
    }

    pub(crate) fn ack_mode(&self, id: &str) -> Option<AckMode> {
        relock(&self.table).entries.get(id).map(|e| e.ack)
    }

    pub(crate) fn len(&self) -> usize {
        relock(&self.table).entries.len()
    }
}

/// A lightweight handle returned from `Connection::subscribe` that packages the
/// subscription id, destination, and the receiving side of the subscription.
///
/// When created by `subscribe`/`subscribe_with_options` the handle is a
/// `Stream` of MESSAGE frames that ends once the subscription is removed or
/// the connection closes. Dropping such a handle removes the subscription
/// locally (no UNSUBSCRIBE is sent). Handles from `subscribe_with_handler`
/// yield nothing; their frames go to the handler, which keeps running after
/// the handle is dropped.
pub struct Subscription {
    id: String,
    destination: String,
    ack: AckMode,
    receiver: Option<mpsc::UnboundedReceiver<Frame>>,
    conn: Connection,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        destination: String,
        ack: AckMode,
        receiver: Option<mpsc::UnboundedReceiver<Frame>>,
        conn: Connection,
    ) -> Self {
        Self {
            id,
            destination,
            ack,
            receiver,
            conn,
        }
    }

    pub(crate) fn channel() -> (Box<dyn MessageHandler>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(ChannelHandler(tx)), rx)
    }

    /// Returns the local subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the destination this subscription listens to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack
    }

    /// Acknowledge `message`. Uses its `ack` header when present, otherwise
    /// its `message-id`.
    pub async fn ack(&self, message: &Frame) -> Result<(), ConnError> {
        let id = ack_id(message)?;
        self.conn.ack(&self.id, id).await
    }

    /// Negative-acknowledge `message`.
    pub async fn nack(&self, message: &Frame) -> Result<(), ConnError> {
        let id = ack_id(message)?;
        self.conn.nack(&self.id, id).await
    }

    /// Unsubscribe, waiting for the broker's receipt up to the connection's
    /// configured `unsubscribe_timeout`.
    pub async fn unsubscribe(self) -> Result<(), ConnError> {
        let timeout = self.conn.unsubscribe_timeout();
        self.unsubscribe_with_timeout(timeout).await
    }

    /// Unsubscribe with an explicit receipt timeout (`None` returns as soon
    /// as UNSUBSCRIBE is written).
    pub async fn unsubscribe_with_timeout(self, timeout: Option<Duration>) -> Result<(), ConnError> {
        self.conn.unsubscribe(&self.id, timeout).await
    }
}

fn ack_id(message: &Frame) -> Result<&str, ConnError> {
    message
        .get_header("ack")
        .or_else(|| message.get_header("message-id"))
        .ok_or_else(|| ConnError::Protocol("message has neither 'ack' nor 'message-id' header".into()))
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("ack", &self.ack)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.receiver.is_some() && self.conn.release_subscription(&self.id) {
            tracing::debug!(
                subscription = %self.id,
                destination = %self.destination,
                "stream dropped without unsubscribe, removed locally"
            );
        }
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        match self.get_mut().receiver.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}
