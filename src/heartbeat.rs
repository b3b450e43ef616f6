//! Heartbeat configuration, negotiation and the liveness monitor.
//!
//! Negotiation is pure: [`negotiate_heartbeats`] maps the client's request
//! and the broker's `heart-beat` header to effective intervals. The
//! [`HeartbeatMonitor`] then decides, from the last read/write timestamps
//! kept in [`Activity`], whether a heartbeat must be written or the peer
//! has gone silent for too long.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ConnError;

/// The peer may be silent for this many receive intervals before the
/// connection is declared dead.
pub const HEARTBEAT_GRACE_FACTOR: u32 = 2;

/// Requested heartbeat intervals in milliseconds (0 disables a direction).
///
/// Renders as the `heart-beat` header value, e.g. `"10000,10000"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// How often the client offers to send heartbeats.
    pub send_ms: u32,
    /// How often the client wants to receive heartbeats.
    pub receive_ms: u32,
}

impl Heartbeat {
    pub fn new(send_ms: u32, receive_ms: u32) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }

    /// No heartbeats in either direction.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// The same interval in both directions.
    pub fn from_duration(interval: Duration) -> Self {
        let ms = u32::try_from(interval.as_millis()).unwrap_or(u32::MAX);
        Self::new(ms, ms)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(10_000, 10_000)
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Returns `(cx, cy)` in milliseconds. Missing or invalid fields default
/// to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Negotiate heartbeat intervals between client and server.
///
/// Parameters
/// - `client_out`: how often the client can send (ms).
/// - `client_in`: how often the client wants to receive (ms).
/// - `server_out`: how often the server can send (ms).
/// - `server_in`: how often the server wants to receive (ms).
///
/// Returns `(outgoing, incoming)`. A direction is enabled only when both
/// sides asked for it (non-zero); the interval is then the larger of the
/// two values.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    fn pair(ours: u64, theirs: u64) -> Option<Duration> {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    }
    (pair(client_out, server_in), pair(client_in, server_out))
}

/// Timestamps of the last write and the last read on a connection.
///
/// Stored as milliseconds since `origin` so both can be updated without a
/// lock from the writer path and the dispatcher.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    fn offset(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.origin).as_millis()).unwrap_or(u64::MAX)
    }

    /// Any frame or heartbeat was written.
    pub fn record_sent(&self) {
        self.last_sent
            .store(self.offset(Instant::now()), Ordering::SeqCst);
    }

    /// Bytes arrived from the peer.
    pub fn record_received(&self) {
        self.last_received
            .store(self.offset(Instant::now()), Ordering::SeqCst);
    }

    pub fn since_sent(&self, now: Instant) -> Duration {
        let last = self.last_sent.load(Ordering::SeqCst);
        Duration::from_millis(self.offset(now).saturating_sub(last))
    }

    pub fn since_received(&self, now: Instant) -> Duration {
        let last = self.last_received.load(Ordering::SeqCst);
        Duration::from_millis(self.offset(now).saturating_sub(last))
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Read half that stamps [`Activity`] whenever bytes arrive, so a large
/// frame trickling in still counts as traffic before it is decoded.
pub(crate) struct ActivityReader<R> {
    inner: R,
    activity: Arc<Activity>,
}

impl<R> ActivityReader<R> {
    pub(crate) fn new(inner: R, activity: Arc<Activity>) -> Self {
        Self { inner, activity }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ActivityReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.record_received();
        }
        polled
    }
}

/// What the monitor wants done next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing was written for a full send interval: write a heartbeat.
    Send,
    /// Nothing was read for longer than the grace period.
    Expired(Duration),
    /// Check again at this instant.
    WaitUntil(Instant),
    /// Both directions are disabled.
    Disabled,
}

/// The connection side the monitor acts on.
pub(crate) trait Liveness: Send + Sync + 'static {
    /// Write a heartbeat marker.
    fn send_heartbeat(&self) -> impl Future<Output = Result<(), ConnError>> + Send;

    /// The peer has been silent for `silence`.
    fn expired(&self, silence: Duration);
}

/// Tracks negotiated intervals against connection activity.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    activity: Arc<Activity>,
    send_interval: Option<Duration>,
    recv_interval: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new(
        activity: Arc<Activity>,
        send_interval: Option<Duration>,
        recv_interval: Option<Duration>,
    ) -> Self {
        Self {
            activity,
            send_interval,
            recv_interval,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.send_interval.is_none() && self.recv_interval.is_none()
    }

    /// Silence tolerated before the connection is declared dead.
    pub fn receive_limit(&self) -> Option<Duration> {
        self.recv_interval.map(|d| d * HEARTBEAT_GRACE_FACTOR)
    }

    /// Decide what to do at `now`.
    pub fn check(&self, now: Instant) -> HeartbeatAction {
        let mut wake: Option<Instant> = None;

        if let Some(limit) = self.receive_limit() {
            let silence = self.activity.since_received(now);
            if silence > limit {
                return HeartbeatAction::Expired(silence);
            }
            // first instant at which silence > limit
            wake = Some(now + (limit - silence) + Duration::from_millis(1));
        }

        if let Some(interval) = self.send_interval {
            let idle = self.activity.since_sent(now);
            if idle >= interval {
                return HeartbeatAction::Send;
            }
            let due = now + (interval - idle);
            wake = Some(wake.map_or(due, |w| w.min(due)));
        }

        match wake {
            Some(at) => HeartbeatAction::WaitUntil(at),
            None => HeartbeatAction::Disabled,
        }
    }

    /// Drive the monitor until `stop` is cancelled, a heartbeat write fails
    /// or the peer expires.
    pub(crate) async fn run<T: Liveness>(self, target: Arc<T>, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                return;
            }
            match self.check(Instant::now()) {
                HeartbeatAction::Send => {
                    tracing::trace!("sending heartbeat");
                    if let Err(e) = target.send_heartbeat().await {
                        tracing::debug!(error = %e, "heartbeat write failed, monitor stopping");
                        return;
                    }
                }
                HeartbeatAction::Expired(silence) => {
                    tracing::warn!(?silence, "no data received from broker within heartbeat grace period");
                    target.expired(silence);
                    return;
                }
                HeartbeatAction::WaitUntil(at) => {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                HeartbeatAction::Disabled => return,
            }
        }
    }
}
