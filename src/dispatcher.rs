//! The connection's single reader task.
//!
//! Reads decoded items from the stream and routes them: CONNECTED to the
//! pending handshake, RECEIPT to the receipt registry, MESSAGE to the
//! subscription registry, ERROR to connection failure. When the loop ends
//! for any reason the dispatcher tears the connection down exactly once.

use futures::{Stream, StreamExt};
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::codec::{CodecError, StompItem};
use crate::connection::{ConnState, Inner, Termination};
use crate::error::{ConnError, ServerError};
use crate::frame::{Command, Frame};

pub(crate) struct Dispatcher<R> {
    inner: Arc<Inner>,
    reader: R,
    connected: Option<oneshot::Sender<Frame>>,
}

impl<R> Dispatcher<R>
where
    R: Stream<Item = Result<StompItem, CodecError>> + Unpin,
{
    pub(crate) fn new(inner: Arc<Inner>, reader: R, connected: oneshot::Sender<Frame>) -> Self {
        Self {
            inner,
            reader,
            connected: Some(connected),
        }
    }

    pub(crate) async fn run(mut self) {
        let termination = self.read_loop().await;
        // dropping the reader closes our half of the stream
        drop(self.reader);
        self.inner.teardown(termination).await;
        // the handshake (if still waiting) observes the drop of `connected`
    }

    async fn read_loop(&mut self) -> Termination {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return self.inner.requested_termination();
                }
                item = self.reader.next() => item,
            };

            match item {
                Some(Ok(StompItem::Heartbeat)) => tracing::trace!("heartbeat received"),
                Some(Ok(StompItem::Frame(frame))) => {
                    if let ControlFlow::Break(t) = self.route(frame) {
                        return t;
                    }
                }
                Some(Err(e)) => return self.read_failed(e.into()),
                None => {
                    return self.read_failed(
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by broker")
                            .into(),
                    );
                }
            }
        }
    }

    fn route(&mut self, frame: Frame) -> ControlFlow<Termination> {
        match frame.command {
            Command::Connected => {
                match self.connected.take() {
                    Some(tx) => {
                        // handshake may have timed out already
                        let _ = tx.send(frame);
                    }
                    None => tracing::debug!("ignoring duplicate CONNECTED frame"),
                }
            }
            Command::Receipt => match frame.get_header("receipt-id") {
                Some(id) => {
                    if !self.inner.receipts.resolve(id, Ok(())) {
                        tracing::debug!(receipt_id = %id, "dropping RECEIPT with no pending waiter");
                    }
                }
                None => tracing::debug!("dropping RECEIPT without receipt-id header"),
            },
            Command::Message => {
                let Some(sub) = frame.get_header("subscription").map(str::to_string) else {
                    tracing::warn!("dropping MESSAGE without subscription header");
                    return ControlFlow::Continue(());
                };
                if !self.inner.subscriptions.dispatch(&sub, frame) {
                    tracing::debug!(subscription = %sub, "dropping MESSAGE for unknown subscription");
                }
            }
            Command::Error => {
                if self.inner.state() == ConnState::Disconnecting {
                    tracing::debug!("ignoring ERROR frame received while disconnecting");
                    return ControlFlow::Continue(());
                }
                let err = ServerError::from_frame(frame);
                tracing::warn!(message = %err.message, "broker sent ERROR");
                return ControlFlow::Break(Termination::Failed(ConnError::ServerError(err)));
            }
            other => {
                tracing::warn!(command = %other, "dropping client frame received from broker");
            }
        }
        ControlFlow::Continue(())
    }

    fn read_failed(&self, err: ConnError) -> Termination {
        if self.inner.state() == ConnState::Disconnecting {
            tracing::debug!(error = %err, "stream ended during disconnect");
            return Termination::Closed;
        }
        tracing::warn!(error = %err, "read failed");
        Termination::Failed(err)
    }
}
