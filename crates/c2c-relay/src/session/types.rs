//! Session contract shared by the device actor and its decorators.

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use c2c_protocol::Message;
use tokio::sync::mpsc;

use crate::error::{RelayError, RelayResult};

/// One event delivered by [`ClientSession::read`].
#[derive(Debug)]
pub enum ReadEvent {
    Message(Message),
    /// No message within the timeout. The loop keeps going.
    Timeout(RelayError),
    /// The inbound queue is closed. Always the last event.
    Eof,
}

/// Consumer of a session's read loop.
///
/// Returning `ControlFlow::Break` stops the loop early.
#[async_trait]
pub trait ReadHandler: Send {
    async fn handle(&mut self, event: ReadEvent) -> ControlFlow<()>;
}

/// Forwards events into a channel; stops once the receiver is gone.
#[async_trait]
impl ReadHandler for mpsc::UnboundedSender<ReadEvent> {
    async fn handle(&mut self, event: ReadEvent) -> ControlFlow<()> {
        match self.send(event) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

/// A client session: the device actor or a decorator around one.
#[async_trait]
pub trait ClientSession: Send + Sync {
    /// Process one inbound command.
    async fn write(&self, msg: Message) -> RelayResult<()>;

    /// Pump outbound messages into `handler` until EOF or the handler breaks.
    ///
    /// Single consumer: concurrent calls on one session wait for each other.
    async fn read(&self, timeout: Duration, handler: &mut dyn ReadHandler);

    /// Tear the session down. Idempotent.
    async fn close(&self) -> RelayResult<()>;

    /// Client ID, or 0 before the identity is established.
    fn id(&self) -> u64;
}
