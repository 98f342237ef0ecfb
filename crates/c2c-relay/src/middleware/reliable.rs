//! Reliable delivery decorator ("safe").
//!
//! Once the wrapped session has an identity, a background task drains that
//! identity's store-and-forward bucket into the live inbound queue: get the
//! oldest message, enqueue it, then acknowledge it. An interrupted drain leaves
//! the unacknowledged message in place, so delivery is at-least-once.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use c2c_protocol::{Command, Message};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RelayResult;
use crate::session::{ClientSession, ConnectionCache, MessageSender, ReadEvent, ReadHandler};
use crate::store::MessageQueue;

pub struct ReliableDelivery {
    inner: Box<dyn ClientSession>,
    registry: ConnectionCache,
    queue: Arc<dyn MessageQueue>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl ReliableDelivery {
    pub fn new(
        inner: Box<dyn ClientSession>,
        registry: ConnectionCache,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            inner,
            registry,
            queue,
            drain: Mutex::new(None),
        }
    }

    /// Start a drain unless one is running or the identity is unknown.
    fn ensure_drain(&self) {
        let recipient = self.inner.id();
        if recipient == 0 {
            return;
        }

        let mut drain = self.drain.lock();
        if drain.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(handle) = self.registry.get(recipient) else {
            return;
        };
        *drain = Some(tokio::spawn(drain_bucket(
            recipient,
            handle.sender(),
            self.queue.clone(),
        )));
    }
}

async fn drain_bucket(recipient: u64, sender: MessageSender, queue: Arc<dyn MessageQueue>) {
    let mut delivered = 0usize;
    loop {
        let unsent = match queue.get_next(recipient).await {
            Ok(Some(unsent)) => unsent,
            Ok(None) => break,
            Err(e) => {
                warn!(client_id = recipient, error = %e, "Failed to read stored messages");
                break;
            }
        };

        if sender.send(unsent.to_message()).await.is_err() {
            debug!(client_id = recipient, "Inbound queue closed during drain");
            break;
        }
        if let Err(e) = queue.is_sended(recipient, unsent.id).await {
            warn!(
                client_id = recipient,
                message_id = unsent.id,
                error = %e,
                "Failed to acknowledge stored message"
            );
            break;
        }
        delivered += 1;
    }

    if delivered > 0 {
        info!(client_id = recipient, delivered = delivered, "Stored messages delivered");
    }
}

fn establishes_identity(command: Command) -> bool {
    matches!(
        command,
        Command::InitById | Command::InitByName | Command::ConnectById | Command::ConnectByName
    )
}

#[async_trait]
impl ClientSession for ReliableDelivery {
    async fn write(&self, msg: Message) -> RelayResult<()> {
        let command = msg.command;
        self.inner.write(msg).await?;
        if establishes_identity(command) {
            self.ensure_drain();
        }
        Ok(())
    }

    async fn read(&self, timeout: Duration, handler: &mut dyn ReadHandler) {
        let mut rechecking = RecheckOnTimeout {
            owner: self,
            inner: handler,
        };
        self.inner.read(timeout, &mut rechecking).await;
    }

    async fn close(&self) -> RelayResult<()> {
        if let Some(task) = self.drain.lock().take() {
            task.abort();
        }
        self.inner.close().await
    }

    fn id(&self) -> u64 {
        self.inner.id()
    }
}

struct RecheckOnTimeout<'a> {
    owner: &'a ReliableDelivery,
    inner: &'a mut dyn ReadHandler,
}

#[async_trait]
impl ReadHandler for RecheckOnTimeout<'_> {
    async fn handle(&mut self, event: ReadEvent) -> ControlFlow<()> {
        if matches!(event, ReadEvent::Timeout(_)) {
            self.owner.ensure_drain();
        }
        self.inner.handle(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceConfig, DeviceSession};
    use crate::store::RelayStorage;
    use c2c_protocol::SERVER_ID;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_millis(30);

    fn reliable(registry: &ConnectionCache, storage: &RelayStorage) -> Arc<ReliableDelivery> {
        let device = DeviceSession::new(
            1,
            DeviceConfig::default(),
            registry.clone(),
            storage.clone(),
        );
        Arc::new(ReliableDelivery::new(
            Box::new(device),
            registry.clone(),
            storage.queue.clone(),
        ))
    }

    fn data(text: &str) -> Message {
        Message::new(Command::Data, "9", "42", ["9", "42", text])
    }

    fn spawn_reader(session: Arc<ReliableDelivery>) -> mpsc::UnboundedReceiver<ReadEvent> {
        let (tx, rx) = mpsc::unbounded_channel::<ReadEvent>();
        tokio::spawn(async move {
            let mut tx = tx;
            session.read(TIMEOUT, &mut tx).await;
        });
        rx
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<ReadEvent>) -> Message {
        loop {
            match rx.recv().await {
                Some(ReadEvent::Message(msg)) => return msg,
                Some(ReadEvent::Timeout(_)) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn stored_messages_follow_init_in_order() {
        let registry = ConnectionCache::new();
        let storage = RelayStorage::in_memory();
        for text in ["first", "second"] {
            storage.queue.add(42, &data(text)).await.unwrap();
        }

        let session = reliable(&registry, &storage);
        session
            .write(Message::new(Command::InitById, "42", SERVER_ID, ["42", "0"]))
            .await
            .unwrap();
        let mut rx = spawn_reader(session.clone());

        assert_eq!(next_message(&mut rx).await.command, Command::InitById);
        assert_eq!(next_message(&mut rx).await.content[2], "first");
        assert_eq!(next_message(&mut rx).await.content[2], "second");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(storage.queue.get_next(42).await.unwrap().is_none());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn read_timeout_rechecks_the_bucket() {
        let registry = ConnectionCache::new();
        let storage = RelayStorage::in_memory();
        let session = reliable(&registry, &storage);
        session
            .write(Message::new(Command::InitById, "42", SERVER_ID, ["42", "0"]))
            .await
            .unwrap();
        let mut rx = spawn_reader(session.clone());
        assert_eq!(next_message(&mut rx).await.command, Command::InitById);

        // Stored behind the session's back, as by a sender racing the init
        storage.queue.add(42, &data("late")).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), next_message(&mut rx))
            .await
            .unwrap();
        assert_eq!(msg.content[2], "late");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn no_drain_without_identity() {
        let registry = ConnectionCache::new();
        let storage = RelayStorage::in_memory();
        let session = reliable(&registry, &storage);

        session
            .write(Message::new(Command::Ping, "", SERVER_ID, ["x"]))
            .await
            .unwrap();
        session.ensure_drain();
        assert!(session.drain.lock().is_none());
    }

    #[tokio::test]
    async fn close_stops_the_drain_and_closes_inner() {
        let registry = ConnectionCache::new();
        let storage = RelayStorage::in_memory();
        let session = reliable(&registry, &storage);
        session
            .write(Message::new(Command::InitById, "42", SERVER_ID, ["42", "0"]))
            .await
            .unwrap();

        session.close().await.unwrap();
        assert!(session.drain.lock().is_none());
        assert!(registry.get(42).is_none());
        assert_eq!(session.id(), 0);
    }
}
