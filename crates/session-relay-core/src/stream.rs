//! Channel-backed streamed connection.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{StreamClosed, StreamConnection};

/// Frame emitted towards the client side of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Raw bytes written by the protocol handler.
    Data(Bytes),
    /// Terminal frame; nothing follows.
    End { status: u16 },
}

/// [`StreamConnection`] whose client side is an mpsc receiver, typically
/// turned into an HTTP response body. Dropping the receiver is a
/// client disconnect.
pub struct ChannelStream {
    sender: Mutex<Option<mpsc::Sender<StreamFrame>>>,
}

impl ChannelStream {
    /// Create a stream and its client-side receiver.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<StreamFrame>> {
        self.sender.lock().ok().and_then(|guard| guard.as_ref().cloned())
    }
}

#[async_trait]
impl StreamConnection for ChannelStream {
    async fn send(&self, data: Bytes) -> Result<(), StreamClosed> {
        let sender = self.sender().ok_or(StreamClosed)?;
        sender
            .send(StreamFrame::Data(data))
            .await
            .map_err(|_| StreamClosed)
    }

    async fn disconnected(&self) {
        match self.sender() {
            Some(sender) => sender.closed().await,
            None => std::future::pending::<()>().await,
        }
    }

    fn finish(&self, status: u16) {
        let taken = self.sender.lock().ok().and_then(|mut guard| guard.take());
        if let Some(sender) = taken {
            // Dropping the sender ends the client stream even if the
            // terminal frame does not fit.
            if sender.try_send(StreamFrame::End { status }).is_err() {
                tracing::debug!(status, "Terminal frame not delivered");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.sender().is_none_or(|sender| sender.is_closed())
    }
}
