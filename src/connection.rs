use futures::SinkExt;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecError, StompCodec, StompItem};
use crate::dispatcher::Dispatcher;
use crate::error::ConnError;
use crate::frame::{Command, Frame};
use crate::heartbeat::{
    Activity, ActivityReader, Heartbeat, HeartbeatMonitor, Liveness, negotiate_heartbeats,
    parse_heartbeat_header,
};
use crate::receipt::ReceiptRegistry;
use crate::subscription::{
    AckMode, MessageHandler, Subscription, SubscriptionOptions, SubscriptionRegistry,
};

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
type FrameWriter = FramedWrite<BoxedWriter, StompCodec>;

/// Upper bound on flushing and shutting down the stream at teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a connection.
///
/// `Closed` and `Failed` are terminal: nothing is written afterwards and
/// every outstanding waiter has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
    Failed,
}

impl ConnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Failed)
    }
}

/// Options for the STOMP CONNECT handshake and connection-wide defaults.
///
/// `accept_version` defaults to `"1.2"` and `host` to `"/"` when left unset.
///
/// # Example
///
/// ```ignore
/// use stomp_wire::{ConnectOptions, Heartbeat};
/// use std::time::Duration;
///
/// let options = ConnectOptions::default()
///     .login("guest")
///     .passcode("guest")
///     .host("/")
///     .heartbeat(Heartbeat::new(5000, 5000))
///     .connect_timeout(Duration::from_secs(5));
/// ```
#[derive(Clone, Default)]
pub struct ConnectOptions {
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Comma-separated list of acceptable protocol versions.
    pub accept_version: Option<String>,
    /// Client id for durable subscriptions (ActiveMQ and Artemis).
    pub client_id: Option<String>,
    /// Virtual host, sent as the `host` header.
    pub host: Option<String>,
    pub heartbeat: Heartbeat,
    /// How long to wait for CONNECTED. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Default receipt timeout for `Subscription::unsubscribe`. `None`
    /// returns as soon as UNSUBSCRIBE is written.
    pub unsubscribe_timeout: Option<Duration>,
    /// Extra CONNECT headers, sent after the standard ones.
    pub headers: Vec<(String, String)>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login(mut self, login: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self
    }

    pub fn passcode(mut self, passcode: impl Into<String>) -> Self {
        self.passcode = Some(passcode.into());
        self
    }

    pub fn accept_version(mut self, version: impl Into<String>) -> Self {
        self.accept_version = Some(version.into());
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Default receipt wait for `Subscription::unsubscribe`. A zero
    /// duration means do not wait.
    pub fn unsubscribe_timeout(mut self, timeout: Duration) -> Self {
        self.unsubscribe_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Add a custom CONNECT header (builder style).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    fn accepted_versions(&self) -> Vec<&str> {
        self.accept_version
            .as_deref()
            .unwrap_or("1.2")
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// The CONNECT frame these options describe.
    pub fn connect_frame(&self) -> Frame {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", self.accept_version.as_deref().unwrap_or("1.2"))
            .header("host", self.host.as_deref().unwrap_or("/"));
        if let Some(login) = &self.login {
            frame = frame.header("login", login);
        }
        if let Some(passcode) = &self.passcode {
            frame = frame.header("passcode", passcode);
        }
        frame = frame.header("heart-beat", self.heartbeat.to_string());
        if let Some(id) = &self.client_id {
            frame = frame.header("client-id", id);
        }
        for (k, v) in &self.headers {
            frame = frame.header(k, v);
        }
        frame
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("login", &self.login)
            .field("passcode", &self.passcode.as_ref().map(|_| "<redacted>"))
            .field("accept_version", &self.accept_version)
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("heartbeat", &self.heartbeat)
            .field("connect_timeout", &self.connect_timeout)
            .field("unsubscribe_timeout", &self.unsubscribe_timeout)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Options for `Connection::send`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub transaction: Option<String>,
    /// Ask the broker for a RECEIPT and wait for it.
    pub receipt: bool,
    /// Bound on the receipt wait. `None` waits until the receipt arrives or
    /// the connection ends.
    pub receipt_timeout: Option<Duration>,
}

impl SendOptions {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction = Some(transaction_id.into());
        self
    }

    pub fn with_receipt(mut self) -> Self {
        self.receipt = true;
        self
    }

    /// Request a receipt and wait at most `timeout` for it.
    pub fn receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt = true;
        self.receipt_timeout = Some(timeout);
        self
    }
}

/// Why a connection ended.
#[derive(Debug, Clone)]
pub(crate) enum Termination {
    Closed,
    Failed(ConnError),
}

/// What the broker told us in CONNECTED.
#[derive(Debug, Clone)]
struct Session {
    version: Option<String>,
    session: Option<String>,
    server: Option<String>,
    heartbeat: (Option<Duration>, Option<Duration>),
}

/// State shared between `Connection` handles, the dispatcher and the
/// heartbeat monitor.
pub(crate) struct Inner {
    // None once torn down; nothing is written after that
    writer: Mutex<Option<FrameWriter>>,
    state: watch::Sender<ConnState>,
    pub(crate) receipts: ReceiptRegistry,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) activity: Arc<Activity>,
    pub(crate) shutdown: CancellationToken,
    termination: OnceLock<Termination>,
    session: OnceLock<Session>,
    options: ConnectOptions,
}

impl Inner {
    fn new(writer: FrameWriter, options: ConnectOptions) -> Self {
        let (state, _) = watch::channel(ConnState::Unconnected);
        Self {
            writer: Mutex::new(Some(writer)),
            state,
            receipts: ReceiptRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            activity: Arc::new(Activity::new()),
            shutdown: CancellationToken::new(),
            termination: OnceLock::new(),
            session: OnceLock::new(),
            options,
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Move from `from` to `to`; returns `false` if the state was not `from`.
    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        let moved = self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(?from, ?to, "connection state changed");
        }
        moved
    }

    fn ensure_connected(&self) -> Result<(), ConnError> {
        match self.state() {
            ConnState::Connected => Ok(()),
            ConnState::Disconnecting | ConnState::Closed => Err(ConnError::AlreadyClosed),
            ConnState::Unconnected | ConnState::Connecting | ConnState::Failed => {
                Err(ConnError::NotConnected)
            }
        }
    }

    fn failure(&self) -> Option<ConnError> {
        match self.termination.get() {
            Some(Termination::Failed(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Ask the dispatcher to end the connection. The first reason wins.
    pub(crate) fn request_termination(&self, reason: Termination) {
        if self.termination.set(reason).is_ok() {
            tracing::debug!(reason = ?self.termination.get(), "termination requested");
        }
        self.shutdown.cancel();
    }

    pub(crate) fn requested_termination(&self) -> Termination {
        self.termination.get().cloned().unwrap_or(Termination::Closed)
    }

    /// Error for a write attempted after teardown began.
    fn unwritable(&self) -> ConnError {
        match self.termination.get() {
            Some(Termination::Failed(_)) => ConnError::NotConnected,
            _ => ConnError::AlreadyClosed,
        }
    }

    /// Serialize one item onto the stream.
    ///
    /// A stream failure ends the connection; an encode failure (e.g. a
    /// `content-length` that disagrees with the body) writes nothing and
    /// leaves the connection usable. A write still pending when shutdown
    /// starts is abandoned and fails with the termination cause.
    pub(crate) async fn write_item(&self, item: StompItem) -> Result<(), ConnError> {
        let mut guard = self.writer.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(self.unwritable());
        }
        let Some(writer) = guard.as_mut() else {
            return Err(self.unwritable());
        };
        let sent = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            sent = writer.send(item) => Some(sent),
        };
        let Some(sent) = sent else {
            // a partial frame may be buffered; the stream is unusable now
            guard.take();
            tracing::debug!("write abandoned at shutdown");
            return Err(self.failure().unwrap_or(ConnError::AlreadyClosed));
        };
        match sent {
            Ok(()) => {
                self.activity.record_sent();
                Ok(())
            }
            Err(CodecError::Protocol(msg)) => Err(ConnError::Protocol(msg)),
            Err(CodecError::Io(e)) => {
                drop(guard);
                let err = ConnError::from(e);
                if self.state() == ConnState::Disconnecting {
                    tracing::debug!(error = %err, "write failed during disconnect");
                    self.request_termination(Termination::Closed);
                } else {
                    tracing::warn!(error = %err, "write failed");
                    self.request_termination(Termination::Failed(err.clone()));
                }
                Err(err)
            }
        }
    }

    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<(), ConnError> {
        tracing::trace!(command = %frame.command, "writing frame");
        self.write_item(StompItem::Frame(frame)).await
    }

    /// Attach a fresh receipt to `frame`, write it and wait for the
    /// RECEIPT.
    async fn write_confirmed(
        &self,
        frame: Frame,
        timeout: Option<Duration>,
        on_timeout: impl FnOnce(String) -> ConnError,
    ) -> Result<(), ConnError> {
        let waiter = self.receipts.register()?;
        let frame = frame.receipt(waiter.id());
        if let Err(e) = self.write_frame(frame).await {
            self.receipts.forget(waiter.id());
            return Err(e);
        }
        self.receipts.wait(waiter, timeout, on_timeout).await
    }

    /// Final cleanup, run once by the dispatcher when its loop ends.
    ///
    /// Waiters and the terminal state are settled before the stream is
    /// closed, so a peer that stopped reading cannot hold them up.
    pub(crate) async fn teardown(&self, reason: Termination) {
        let reason = self.termination.get_or_init(|| reason).clone();
        // also wakes any write stuck on a full stream
        self.shutdown.cancel();

        let (state, waiter_err) = match reason {
            Termination::Closed => (ConnState::Closed, ConnError::Closed),
            Termination::Failed(e) => (ConnState::Failed, e),
        };
        let pending = self.receipts.pending();
        let subscriptions = self.subscriptions.len();
        self.receipts.resolve_all(waiter_err.clone());
        self.subscriptions.clear(waiter_err.clone());
        self.state.send_replace(state);

        match state {
            ConnState::Failed => {
                tracing::warn!(error = %waiter_err, pending, subscriptions, "connection failed")
            }
            _ => tracing::info!(pending, subscriptions, "connection closed"),
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_TIMEOUT, SinkExt::<StompItem>::close(&mut writer))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "error closing stream"),
                Err(_) => tracing::debug!("stream close timed out"),
            }
        }
    }

    async fn wait_terminal(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }
}

impl Liveness for Inner {
    async fn send_heartbeat(&self) -> Result<(), ConnError> {
        self.write_item(StompItem::Heartbeat).await
    }

    fn expired(&self, silence: Duration) {
        if self.state() == ConnState::Disconnecting {
            self.request_termination(Termination::Closed);
        } else {
            self.request_termination(Termination::Failed(ConnError::HeartbeatTimeout(silence)));
        }
    }
}

/// High-level connection object that manages a single STOMP session over a
/// byte stream.
///
/// A background dispatcher task owns the read half of the stream and routes
/// inbound frames; writes from any handle are serialized through one lock.
/// Handles are cheap to clone and share the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Heartbeat header value that disables heartbeats entirely.
    pub const NO_HEARTBEAT: &'static str = "0,0";

    /// Default heartbeat header value: 10 seconds send and receive.
    pub const DEFAULT_HEARTBEAT: &'static str = "10000,10000";

    /// Open a TCP connection to `addr` (host:port) and perform the STOMP
    /// handshake over it.
    pub async fn connect(addr: &str, options: ConnectOptions) -> Result<Self, ConnError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ConnError::ConnectFailed(Box::new(e.into())))?;
        tracing::debug!(%addr, "tcp connected");
        Self::connect_stream(stream, options).await
    }

    /// Perform the STOMP handshake over an already-open stream.
    ///
    /// Writes CONNECT, starts the dispatcher and waits for CONNECTED. On
    /// success the negotiated heartbeats are started. An ERROR frame, a
    /// stream failure or an unsupported `version` fail with
    /// `ConnError::ConnectFailed` wrapping the cause; no CONNECTED within
    /// `connect_timeout` fails with `ConnError::ConnectTimeout`. Either way
    /// the connection has reached a terminal state before this returns.
    pub async fn connect_stream<S>(stream: S, options: ConnectOptions) -> Result<Self, ConnError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::pin(write_half);
        let inner = Arc::new(Inner::new(
            FramedWrite::new(writer, StompCodec::new()),
            options,
        ));
        inner.transition(ConnState::Unconnected, ConnState::Connecting);

        let (connected_tx, connected_rx) = oneshot::channel();
        let reader = FramedRead::new(
            ActivityReader::new(read_half, inner.activity.clone()),
            StompCodec::new(),
        );
        tokio::spawn(Dispatcher::new(inner.clone(), reader, connected_tx).run());

        let conn = Connection { inner };
        match conn.handshake(connected_rx).await {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.inner.request_termination(Termination::Failed(err.clone()));
                conn.inner.wait_terminal().await;
                match err {
                    ConnError::ConnectTimeout(_) => Err(err),
                    other => Err(ConnError::ConnectFailed(Box::new(other))),
                }
            }
        }
    }

    async fn handshake(&self, connected: oneshot::Receiver<Frame>) -> Result<(), ConnError> {
        let inner = &self.inner;
        let options = &inner.options;
        inner.write_frame(options.connect_frame()).await?;

        let received = match options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connected)
                .await
                .map_err(|_| ConnError::ConnectTimeout(limit))?,
            None => connected.await,
        };
        // the dispatcher drops the sender only after teardown recorded why
        let frame = received.map_err(|_| {
            inner
                .failure()
                .unwrap_or_else(|| ConnError::Protocol("stream closed before CONNECTED".into()))
        })?;

        let version = frame.get_header("version").map(str::to_string);
        if let Some(v) = &version {
            if !options.accepted_versions().contains(&v.as_str()) {
                return Err(ConnError::Protocol(format!(
                    "broker selected unsupported version '{}'",
                    v
                )));
            }
        }

        let (cx, cy) = (
            u64::from(options.heartbeat.send_ms),
            u64::from(options.heartbeat.receive_ms),
        );
        let (sx, sy) = parse_heartbeat_header(frame.get_header("heart-beat").unwrap_or("0,0"));
        let (send_interval, recv_interval) = negotiate_heartbeats(cx, cy, sx, sy);

        let _ = inner.session.set(Session {
            version,
            session: frame.get_header("session").map(str::to_string),
            server: frame.get_header("server").map(str::to_string),
            heartbeat: (send_interval, recv_interval),
        });

        if !inner.transition(ConnState::Connecting, ConnState::Connected) {
            return Err(inner.failure().unwrap_or(ConnError::Closed));
        }

        let monitor = HeartbeatMonitor::new(inner.activity.clone(), send_interval, recv_interval);
        if !monitor.is_disabled() {
            tokio::spawn(monitor.run(inner.clone(), inner.shutdown.child_token()));
        }
        tracing::info!(
            version = ?self.version(),
            session = ?self.session(),
            ?send_interval,
            ?recv_interval,
            "connected"
        );
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.inner.state()
    }

    /// Wait until the connection has ended.
    ///
    /// Returns `Ok(())` after a graceful disconnect and the fatal cause
    /// otherwise.
    pub async fn closed(&self) -> Result<(), ConnError> {
        self.inner.wait_terminal().await;
        match self.inner.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Negotiated protocol version from CONNECTED.
    pub fn version(&self) -> Option<&str> {
        self.inner.session.get().and_then(|s| s.version.as_deref())
    }

    /// Broker-assigned session id.
    pub fn session(&self) -> Option<&str> {
        self.inner.session.get().and_then(|s| s.session.as_deref())
    }

    /// Broker `server` header.
    pub fn server(&self) -> Option<&str> {
        self.inner.session.get().and_then(|s| s.server.as_deref())
    }

    /// Negotiated `(outgoing, incoming)` heartbeat intervals; `None` means
    /// disabled in that direction.
    pub fn heartbeat(&self) -> (Option<Duration>, Option<Duration>) {
        self.inner
            .session
            .get()
            .map(|s| s.heartbeat)
            .unwrap_or((None, None))
    }

    pub fn unsubscribe_timeout(&self) -> Option<Duration> {
        self.inner.options.unsubscribe_timeout
    }

    /// Drop a subscription locally without telling the broker.
    pub(crate) fn release_subscription(&self, subscription_id: &str) -> bool {
        self.inner.subscriptions.remove(subscription_id)
    }

    /// Send a message to `destination`.
    ///
    /// Returns once the frame is written, or, when `options.receipt` is
    /// set, once the broker confirmed it. A missing confirmation within
    /// `options.receipt_timeout` yields `ConnError::ReceiptTimeout` and the
    /// connection stays usable.
    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> Result<(), ConnError> {
        self.inner.ensure_connected()?;
        let mut frame = Frame::new(Command::Send).header("destination", destination);
        if let Some(ct) = &options.content_type {
            frame = frame.header("content-type", ct);
        }
        if let Some(tx) = &options.transaction {
            frame = frame.header("transaction", tx);
        }
        for (k, v) in options.headers {
            frame = frame.header(k, v);
        }
        let frame = frame.set_body(body);

        if options.receipt {
            self.inner
                .write_confirmed(frame, options.receipt_timeout, ConnError::ReceiptTimeout)
                .await
        } else {
            self.inner.write_frame(frame).await
        }
    }

    /// Write an arbitrary client frame as-is.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ConnError> {
        self.inner.ensure_connected()?;
        if frame.command.is_server_command() {
            return Err(ConnError::Protocol(format!(
                "{} is not a client frame",
                frame.command
            )));
        }
        self.inner.write_frame(frame).await
    }

    /// Send a frame and wait for server confirmation via RECEIPT.
    ///
    /// A fresh `receipt` header is added to `frame`.
    ///
    /// # Example
    /// ```ignore
    /// let frame = Frame::new(Command::Send)
    ///     .header("destination", "/queue/orders")
    ///     .set_body(b"order data".to_vec());
    ///
    /// conn.send_frame_confirmed(frame, Duration::from_secs(5)).await?;
    /// ```
    pub async fn send_frame_confirmed(
        &self,
        frame: Frame,
        timeout: Duration,
    ) -> Result<(), ConnError> {
        self.inner.ensure_connected()?;
        if frame.command.is_server_command() {
            return Err(ConnError::Protocol(format!(
                "{} is not a client frame",
                frame.command
            )));
        }
        self.inner
            .write_confirmed(frame, Some(timeout), ConnError::ReceiptTimeout)
            .await
    }

    /// Subscribe to a destination.
    ///
    /// Returns a `Subscription` that yields the MESSAGE frames for this
    /// subscription as a `Stream`.
    pub async fn subscribe(
        &self,
        destination: &str,
        ack: AckMode,
    ) -> Result<Subscription, ConnError> {
        self.subscribe_with_options(destination, ack, SubscriptionOptions::default())
            .await
    }

    /// Subscribe with a typed `SubscriptionOptions` structure.
    ///
    /// `SubscriptionOptions.headers` are forwarded to the broker. If
    /// `durable_queue` is set, it will be used as the actual destination
    /// instead of `destination`.
    pub async fn subscribe_with_options(
        &self,
        destination: &str,
        ack: AckMode,
        options: SubscriptionOptions,
    ) -> Result<Subscription, ConnError> {
        let (handler, receiver) = Subscription::channel();
        self.register_subscription(destination, ack, options, handler, Some(receiver))
            .await
    }

    /// Subscribe and deliver every MESSAGE to `handler`, called on the
    /// connection's reader task.
    pub async fn subscribe_with_handler<H: MessageHandler>(
        &self,
        destination: &str,
        ack: AckMode,
        options: SubscriptionOptions,
        handler: H,
    ) -> Result<Subscription, ConnError> {
        self.register_subscription(destination, ack, options, Box::new(handler), None)
            .await
    }

    async fn register_subscription(
        &self,
        destination: &str,
        ack: AckMode,
        options: SubscriptionOptions,
        handler: Box<dyn MessageHandler>,
        receiver: Option<tokio::sync::mpsc::UnboundedReceiver<Frame>>,
    ) -> Result<Subscription, ConnError> {
        self.inner.ensure_connected()?;
        let destination = options
            .durable_queue
            .as_deref()
            .unwrap_or(destination)
            .to_string();

        // registered before SUBSCRIBE goes out so no MESSAGE can race ahead
        let id = self
            .inner
            .subscriptions
            .register(&destination, ack, handler)?;
        let mut frame = Frame::new(Command::Subscribe)
            .header("id", &id)
            .header("destination", &destination)
            .header("ack", ack.as_str());
        for (k, v) in options.headers {
            frame = frame.header(k, v);
        }
        if let Err(e) = self.inner.write_frame(frame).await {
            self.inner.subscriptions.remove(&id);
            return Err(e);
        }

        tracing::debug!(subscription = %id, %destination, %ack, "subscribed");
        Ok(Subscription::new(id, destination, ack, receiver, self.clone()))
    }

    /// Unsubscribe a previously created subscription by its local id.
    ///
    /// The subscription is removed locally first: once UNSUBSCRIBE is
    /// written no MESSAGE for `subscription_id` is delivered. The frame
    /// always carries a `receipt` header; with `timeout` set the call waits
    /// for that RECEIPT and fails with `ConnError::UnsubscribeTimeout` if it
    /// does not arrive in time. With `timeout` unset or zero it returns
    /// right after the write.
    pub async fn unsubscribe(
        &self,
        subscription_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ConnError> {
        self.inner.ensure_connected()?;
        let timeout = timeout.filter(|t| !t.is_zero());
        if !self.inner.subscriptions.remove(subscription_id) {
            return Err(ConnError::SubscriptionNotFound(subscription_id.to_string()));
        }
        tracing::debug!(subscription = %subscription_id, ?timeout, "unsubscribing");

        let frame = Frame::new(Command::Unsubscribe).header("id", subscription_id);
        match timeout {
            Some(limit) => {
                let sub = subscription_id.to_string();
                self.inner
                    .write_confirmed(frame, Some(limit), move |_| {
                        ConnError::UnsubscribeTimeout(sub)
                    })
                    .await
            }
            None => {
                let frame = frame.receipt(self.inner.receipts.allocate_id());
                self.inner.write_frame(frame).await
            }
        }
    }

    /// Acknowledge a message received on a `client` or `client-individual`
    /// subscription.
    ///
    /// Sends an `ACK` frame with `id=<message_id>` and
    /// `subscription=<subscription_id>` headers.
    pub async fn ack(&self, subscription_id: &str, message_id: &str) -> Result<(), ConnError> {
        self.send_ack(Command::Ack, subscription_id, message_id).await
    }

    /// Negative-acknowledge a message (NACK).
    pub async fn nack(&self, subscription_id: &str, message_id: &str) -> Result<(), ConnError> {
        self.send_ack(Command::Nack, subscription_id, message_id).await
    }

    async fn send_ack(
        &self,
        command: Command,
        subscription_id: &str,
        message_id: &str,
    ) -> Result<(), ConnError> {
        self.inner.ensure_connected()?;
        if self.inner.subscriptions.ack_mode(subscription_id) == Some(AckMode::Auto) {
            tracing::debug!(subscription = %subscription_id, %command, "acknowledging on an auto-ack subscription");
        }
        let frame = Frame::new(command)
            .header("id", message_id)
            .header("subscription", subscription_id);
        self.inner.write_frame(frame).await
    }

    /// Helper to send a transaction frame (BEGIN, COMMIT, or ABORT).
    async fn send_transaction_frame(
        &self,
        command: Command,
        transaction_id: &str,
    ) -> Result<(), ConnError> {
        self.inner.ensure_connected()?;
        let frame = Frame::new(command).header("transaction", transaction_id);
        self.inner.write_frame(frame).await
    }

    /// Begin a transaction.
    ///
    /// Subsequent `SEND` frames may carry this id (see
    /// `SendOptions::transaction`). Finish with `commit` or `abort`.
    pub async fn begin(&self, transaction_id: &str) -> Result<(), ConnError> {
        self.send_transaction_frame(Command::Begin, transaction_id)
            .await
    }

    /// Commit a transaction.
    pub async fn commit(&self, transaction_id: &str) -> Result<(), ConnError> {
        self.send_transaction_frame(Command::Commit, transaction_id)
            .await
    }

    /// Abort a transaction.
    pub async fn abort(&self, transaction_id: &str) -> Result<(), ConnError> {
        self.send_transaction_frame(Command::Abort, transaction_id)
            .await
    }

    /// Close the session gracefully.
    ///
    /// Writes DISCONNECT (with a receipt when `timeout` is set, waiting up to
    /// `timeout` for it), then closes the stream, stops heartbeats and
    /// resolves every outstanding waiter with `ConnError::Closed`. A
    /// missing DISCONNECT receipt is logged, not returned, and so is a
    /// stream that breaks while DISCONNECT is written. Calling this on a
    /// connection that is already disconnecting, closed or failed does
    /// nothing.
    pub async fn disconnect(&self, timeout: Option<Duration>) -> Result<(), ConnError> {
        if !self
            .inner
            .transition(ConnState::Connected, ConnState::Disconnecting)
        {
            tracing::debug!(state = ?self.state(), "disconnect ignored");
            return Ok(());
        }

        let frame = Frame::new(Command::Disconnect);
        let written = match timeout {
            Some(limit) => {
                self.inner
                    .write_confirmed(frame, Some(limit), ConnError::ReceiptTimeout)
                    .await
            }
            None => self.inner.write_frame(frame).await,
        };
        let outcome = match written {
            Ok(()) | Err(ConnError::Closed) | Err(ConnError::AlreadyClosed) => Ok(()),
            Err(ConnError::ReceiptTimeout(id)) => {
                tracing::warn!(receipt_id = %id, "no RECEIPT for DISCONNECT, closing anyway");
                Ok(())
            }
            // the stream broke under DISCONNECT; the session is over either way
            Err(ConnError::Io(_)) => Ok(()),
            Err(e) => Err(e),
        };

        self.inner.request_termination(Termination::Closed);
        self.inner.wait_terminal().await;
        outcome
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("version", &self.version())
            .field("session", &self.session())
            .finish()
    }
}
