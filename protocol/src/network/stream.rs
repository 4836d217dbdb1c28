//! In-process protocol endpoints.
//!
//! A [`ProtocolStream`] is the transport-facing side of one peer session:
//! push what the remote sent with [`send`](ProtocolStream::send), pull what
//! should go to the remote with [`recv`](ProtocolStream::recv). Dropping it
//! ends the session.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::message::Message;
use crate::error::{Error, Result};

pub struct ProtocolStream {
    inbound: mpsc::Sender<Message>,
    outbound: mpsc::Receiver<Message>,
}

impl ProtocolStream {
    pub(crate) fn new(inbound: mpsc::Sender<Message>, outbound: mpsc::Receiver<Message>) -> Self {
        Self { inbound, outbound }
    }

    /// Deliver a message received from the remote peer.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.inbound
            .send(message)
            .await
            .map_err(|_| Error::PeerDisconnected)
    }

    /// Next message to transmit to the remote peer. `None` once the session
    /// has ended.
    pub async fn recv(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    /// Split into the raw channel halves, for transports that pump each
    /// direction from a separate task.
    pub fn into_parts(self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        (self.inbound, self.outbound)
    }
}

/// Pipe two endpoints into each other. The task ends when either side
/// closes.
pub fn connect(a: ProtocolStream, b: ProtocolStream) -> JoinHandle<()> {
    let (a_in, a_out) = a.into_parts();
    let (b_in, b_out) = b.into_parts();
    tokio::spawn(async move {
        tokio::join!(pump(a_out, b_in), pump(b_out, a_in));
    })
}

async fn pump(mut from: mpsc::Receiver<Message>, to: mpsc::Sender<Message>) {
    while let Some(message) = from.recv().await {
        trace!(kind = message.kind(), "piping message");
        if to.send(message).await.is_err() {
            break;
        }
    }
}
