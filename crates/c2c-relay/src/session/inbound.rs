//! Bounded inbound queue of a session.
//!
//! Many producers (other sessions, the drain task, the session itself) hold a
//! [`MessageSender`]; the session's read loop is the single consumer. Closing
//! is signalled through a [`CancellationToken`] so a close from any task wakes
//! blocked producers and lets the consumer drain what was already buffered.

use c2c_protocol::Message;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Enqueue failed; the message is handed back.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("inbound queue is closed")]
    Closed(Message),

    #[error("inbound queue is full")]
    Full(Message),
}

impl SendError {
    pub fn into_inner(self) -> Message {
        match self {
            SendError::Closed(msg) | SendError::Full(msg) => msg,
        }
    }
}

/// Create a queue with room for `capacity` messages.
pub fn inbound_queue(capacity: usize) -> (MessageSender, InboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        MessageSender {
            tx,
            closed: closed.clone(),
        },
        InboundReceiver {
            rx,
            closed,
            draining: false,
        },
    )
}

/// Enqueue-only capability on a session's inbound queue.
#[derive(Clone, Debug)]
pub struct MessageSender {
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl MessageSender {
    /// Enqueue, waiting for room. Fails only when the queue is closed.
    pub async fn send(&self, msg: Message) -> Result<(), SendError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(SendError::Closed(msg)),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(msg);
                    Ok(())
                }
                Err(_) => Err(SendError::Closed(msg)),
            },
        }
    }

    /// Enqueue without waiting.
    pub fn try_send(&self, msg: Message) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed(msg));
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(msg) => SendError::Full(msg),
            mpsc::error::TrySendError::Closed(msg) => SendError::Closed(msg),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Close the queue. Buffered messages remain readable.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// True when both senders feed the same queue.
    pub fn same_queue(&self, other: &MessageSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Consumer side of an inbound queue.
#[derive(Debug)]
pub struct InboundReceiver {
    rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
    draining: bool,
}

impl InboundReceiver {
    /// Next message; `None` once the queue is closed and drained.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Message> {
        if !self.draining {
            tokio::select! {
                msg = self.rx.recv() => return msg,
                _ = self.closed.cancelled() => {}
            }
            self.rx.close();
            self.draining = true;
        }
        self.rx.recv().await
    }
}
