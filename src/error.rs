use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecError;
use crate::frame::Frame;

/// A broker `ERROR` frame, unpacked.
///
/// The broker closes the connection after sending ERROR, so a `ServerError`
/// is always fatal to the connection that received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// The `message` header (or `"unknown error"` when missing).
    pub message: String,
    /// The body as text, if there is one.
    pub body: Option<String>,
    /// The `receipt-id` header, present when the broker rejected a frame
    /// that asked for a receipt.
    pub receipt_id: Option<String>,
    /// The original frame, for broker-specific headers.
    pub frame: Frame,
}

impl ServerError {
    pub fn from_frame(frame: Frame) -> Self {
        let message = frame
            .get_header("message")
            .unwrap_or("unknown error")
            .to_string();
        let body = if frame.body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&frame.body).into_owned())
        };
        let receipt_id = frame.get_header("receipt-id").map(str::to_string);
        Self {
            message,
            body,
            receipt_id,
            frame,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STOMP server error: {}", self.message)?;
        if let Some(body) = &self.body {
            write!(f, " ({})", body.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

/// Errors returned by `Connection` operations.
///
/// Fatal variants (`Io`, `Protocol`, `ServerError`, `HeartbeatTimeout`,
/// `ConnectFailed`, `ConnectTimeout`) end the connection; the same value is
/// handed to every caller that was waiting on it. The type is `Clone` for
/// that reason, with io errors shared behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum ConnError {
    /// Stream failure or unexpected EOF.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    /// Malformed frame or protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The handshake failed before CONNECTED was received.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] Box<ConnError>),
    /// No CONNECTED frame arrived within the connect timeout.
    #[error("connect timeout: no CONNECTED frame within {0:?}")]
    ConnectTimeout(Duration),
    /// The broker sent an ERROR frame.
    #[error("{0}")]
    ServerError(ServerError),
    /// Nothing was received from the broker for longer than the grace period.
    #[error("heartbeat timeout: no data received for {0:?}")]
    HeartbeatTimeout(Duration),
    /// A receipted frame was not confirmed in time.
    #[error("receipt timeout: no RECEIPT received for '{0}' within timeout")]
    ReceiptTimeout(String),
    /// UNSUBSCRIBE was not confirmed in time. The subscription has been
    /// removed locally regardless.
    #[error("unsubscribe timeout: no RECEIPT for subscription '{0}' within timeout")]
    UnsubscribeTimeout(String),
    /// The operation needs a connected session.
    #[error("not connected")]
    NotConnected,
    /// The connection has been (or is being) closed by `disconnect`.
    #[error("connection already closed")]
    AlreadyClosed,
    /// The connection closed while the caller was waiting.
    #[error("connection closed")]
    Closed,
    /// No active subscription with that id.
    #[error("subscription '{0}' not found")]
    SubscriptionNotFound(String),
}

impl ConnError {
    /// Returns `true` if this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnError::Io(_)
                | ConnError::Protocol(_)
                | ConnError::ConnectFailed(_)
                | ConnError::ConnectTimeout(_)
                | ConnError::ServerError(_)
                | ConnError::HeartbeatTimeout(_)
        )
    }

    /// The broker ERROR behind this error, looking through `ConnectFailed`.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            ConnError::ServerError(e) => Some(e),
            ConnError::ConnectFailed(inner) => inner.server_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(Arc::new(e))
    }
}

impl From<CodecError> for ConnError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => ConnError::from(e),
            CodecError::Protocol(msg) => ConnError::Protocol(msg),
        }
    }
}
