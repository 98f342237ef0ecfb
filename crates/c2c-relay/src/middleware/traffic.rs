//! Traffic accounting decorator ("limits").
//!
//! Counts payload bytes in both directions against the client's persistent
//! [`ClientStat`]. The record is loaded lazily once the client identity is
//! known; bytes seen before that are carried over. A pluggable validator runs
//! before each accounted message and can reject writes or end the read loop.
//! The outbound message that trips the quota is dropped: it is neither handed
//! to the reader nor put back in the queue.

use std::mem;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use c2c_protocol::Message;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{RelayError, RelayResult};
use crate::session::{ClientSession, ReadEvent, ReadHandler};
use crate::store::{ClientStat, StatStore};

/// Quota check run against the current counters.
pub type Validator = Arc<dyn Fn(&ClientStat) -> RelayResult<()> + Send + Sync>;

/// Validator enforcing byte quotas. `0` means unlimited.
pub fn quota_validator(max_receive_bytes: u64, max_transmit_bytes: u64) -> Validator {
    Arc::new(move |stat: &ClientStat| {
        if max_receive_bytes > 0 && stat.receive_bytes > max_receive_bytes {
            return Err(RelayError::traffic_limit(format!(
                "client {} sent {} bytes, limit is {max_receive_bytes}",
                stat.id, stat.receive_bytes
            )));
        }
        if max_transmit_bytes > 0 && stat.transmit_bytes > max_transmit_bytes {
            return Err(RelayError::traffic_limit(format!(
                "client {} received {} bytes, limit is {max_transmit_bytes}",
                stat.id, stat.transmit_bytes
            )));
        }
        Ok(())
    })
}

#[derive(Debug, Default)]
struct Ledger {
    stat: Option<ClientStat>,
    pending_receive: u64,
    pending_transmit: u64,
}

impl Ledger {
    fn attach(&mut self, mut stat: ClientStat) {
        stat.receive_bytes += mem::take(&mut self.pending_receive);
        stat.transmit_bytes += mem::take(&mut self.pending_transmit);
        self.stat = Some(stat);
    }

    fn add_receive(&mut self, bytes: u64) {
        match &mut self.stat {
            Some(stat) => stat.receive_bytes += bytes,
            None => self.pending_receive += bytes,
        }
    }

    fn add_transmit(&mut self, bytes: u64) {
        match &mut self.stat {
            Some(stat) => stat.transmit_bytes += bytes,
            None => self.pending_transmit += bytes,
        }
    }
}

pub struct TrafficCounter {
    inner: Box<dyn ClientSession>,
    stats: StatStore,
    validate: Validator,
    ledger: Mutex<Ledger>,
}

impl TrafficCounter {
    pub fn new(inner: Box<dyn ClientSession>, stats: StatStore, validate: Validator) -> Self {
        Self {
            inner,
            stats,
            validate,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Load the stat record for `id` unless already loaded or `id` is unknown.
    async fn ensure_loaded(&self, ledger: &mut Ledger, id: u64) {
        if ledger.stat.is_some() || id == 0 {
            return;
        }
        match self.stats.load_or_create(id).await {
            Ok(stat) => ledger.attach(stat),
            Err(e) => warn!(client_id = id, error = %e, "Failed to load traffic stats"),
        }
    }

    fn check(&self, ledger: &Ledger) -> RelayResult<()> {
        match &ledger.stat {
            Some(stat) => (self.validate)(stat),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClientSession for TrafficCounter {
    async fn write(&self, msg: Message) -> RelayResult<()> {
        {
            let mut ledger = self.ledger.lock().await;
            self.ensure_loaded(&mut ledger, self.inner.id()).await;
            self.check(&ledger)?;
            ledger.add_receive(msg.content_len() as u64);
        }

        let result = self.inner.write(msg).await;

        let mut ledger = self.ledger.lock().await;
        self.ensure_loaded(&mut ledger, self.inner.id()).await;
        result
    }

    async fn read(&self, timeout: Duration, handler: &mut dyn ReadHandler) {
        let mut counting = CountingHandler {
            counter: self,
            inner: handler,
        };
        self.inner.read(timeout, &mut counting).await;
    }

    async fn close(&self) -> RelayResult<()> {
        let snapshot = {
            let mut ledger = self.ledger.lock().await;
            self.ensure_loaded(&mut ledger, self.inner.id()).await;
            ledger.stat.clone()
        };

        if let Some(stat) = snapshot {
            match self.stats.save(&stat).await {
                Ok(()) => debug!(
                    client_id = stat.id,
                    receive_bytes = stat.receive_bytes,
                    transmit_bytes = stat.transmit_bytes,
                    "Traffic stats saved"
                ),
                Err(e) => error!(client_id = stat.id, error = %e, "Failed to save traffic stats"),
            }
        }

        self.inner.close().await
    }

    fn id(&self) -> u64 {
        self.inner.id()
    }
}

struct CountingHandler<'a> {
    counter: &'a TrafficCounter,
    inner: &'a mut dyn ReadHandler,
}

#[async_trait]
impl ReadHandler for CountingHandler<'_> {
    async fn handle(&mut self, event: ReadEvent) -> ControlFlow<()> {
        if let ReadEvent::Message(msg) = &event {
            let mut ledger = self.counter.ledger.lock().await;
            self.counter
                .ensure_loaded(&mut ledger, self.counter.inner.id())
                .await;

            if let Err(e) = self.counter.check(&ledger) {
                drop(ledger);
                warn!(client_id = self.counter.id(), error = %e, "Traffic limit reached, ending read");
                let _ = self.inner.handle(ReadEvent::Eof).await;
                return ControlFlow::Break(());
            }
            ledger.add_transmit(msg.content_len() as u64);
        }
        self.inner.handle(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionCache, DeviceConfig, DeviceSession};
    use crate::store::RelayStorage;
    use c2c_protocol::{Command, ErrorKind, SERVER_ID};
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn counter(storage: &RelayStorage, validate: Validator) -> TrafficCounter {
        counter_in(storage, &ConnectionCache::new(), 1, validate)
    }

    fn counter_in(
        storage: &RelayStorage,
        registry: &ConnectionCache,
        session_id: u32,
        validate: Validator,
    ) -> TrafficCounter {
        let device = DeviceSession::new(
            session_id,
            DeviceConfig::default(),
            registry.clone(),
            storage.clone(),
        );
        TrafficCounter::new(Box::new(device), storage.stats.clone(), validate)
    }

    fn init(name: &str) -> Message {
        Message::new(Command::InitByName, name, SERVER_ID, [name, "0"])
    }

    /// Collects `n` messages, then stops the loop.
    struct Take {
        remaining: usize,
        seen: Vec<Message>,
    }

    #[async_trait]
    impl ReadHandler for Take {
        async fn handle(&mut self, event: ReadEvent) -> ControlFlow<()> {
            match event {
                ReadEvent::Message(msg) => {
                    self.seen.push(msg);
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
                ReadEvent::Timeout(_) => ControlFlow::Continue(()),
                ReadEvent::Eof => ControlFlow::Break(()),
            }
        }
    }

    #[test]
    fn quota_validator_limits() {
        let validate = quota_validator(10, 0);
        let mut stat = ClientStat {
            id: 1,
            receive_bytes: 10,
            transmit_bytes: 1_000_000,
        };
        assert!(validate(&stat).is_ok());

        stat.receive_bytes = 11;
        let err = validate(&stat).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TrafficLimit);
    }

    #[tokio::test]
    async fn close_persists_counted_bytes_on_top_of_existing() {
        let storage = RelayStorage::in_memory();
        let id = storage.directory.claim("alice").await.unwrap().id;
        storage
            .stats
            .save(&ClientStat {
                id,
                receive_bytes: 100,
                transmit_bytes: 50,
            })
            .await
            .unwrap();

        let session = counter(&storage, quota_validator(0, 0));
        let written = vec![
            init("alice"),
            Message::new(Command::Data, "alice", "77", ["alice", "77", "hello world"]),
            Message::new(Command::Ping, "alice", SERVER_ID, ["ping"]),
        ];
        let n: usize = written.iter().map(Message::content_len).sum();
        for msg in written {
            session.write(msg).await.unwrap();
        }

        let mut take = Take {
            remaining: 2,
            seen: Vec::new(),
        };
        session.read(TIMEOUT, &mut take).await;
        let m: usize = take.seen.iter().map(Message::content_len).sum();

        session.close().await.unwrap();

        let stat = storage.stats.load_or_create(id).await.unwrap();
        assert_eq!(stat.receive_bytes, 100 + n as u64);
        assert_eq!(stat.transmit_bytes, 50 + m as u64);
    }

    #[tokio::test]
    async fn write_over_quota_is_rejected() {
        let storage = RelayStorage::in_memory();
        let session = counter(&storage, quota_validator(5, 0));

        // 6 bytes, accepted because the check runs before counting
        session.write(init("alice")).await.unwrap();

        let err = session
            .write(Message::new(Command::Ping, "alice", SERVER_ID, ["x"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TrafficLimit);
    }

    #[tokio::test]
    async fn read_over_quota_ends_with_eof() {
        let storage = RelayStorage::in_memory();
        let session = counter(&storage, quota_validator(0, 1));
        session.write(init("alice")).await.unwrap();
        session
            .write(Message::new(Command::Ping, "alice", SERVER_ID, ["x"]))
            .await
            .unwrap();

        let (mut tx, mut rx) = mpsc::unbounded_channel::<ReadEvent>();
        session.read(TIMEOUT, &mut tx).await;
        drop(tx);

        assert!(matches!(rx.recv().await, Some(ReadEvent::Message(m)) if m.command == Command::InitByName));
        assert!(matches!(rx.recv().await, Some(ReadEvent::Eof)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn bytes_before_identity_are_kept() {
        let storage = RelayStorage::in_memory();
        let session = counter(&storage, quota_validator(0, 0));

        let ping = Message::new(Command::Ping, "", SERVER_ID, ["early"]);
        session.write(ping).await.unwrap();
        session.write(init("bob")).await.unwrap();
        let id = session.id();
        session.close().await.unwrap();

        let stat = storage.stats.load_or_create(id).await.unwrap();
        assert_eq!(stat.receive_bytes, ("early".len() + "bob".len() + 1) as u64);
    }

    #[tokio::test]
    async fn numeric_from_does_not_choose_the_ledger() {
        let storage = RelayStorage::in_memory();
        let session = counter(&storage, quota_validator(0, 0));

        session
            .write(Message::new(Command::InitByName, "42", SERVER_ID, ["bob", "0"]))
            .await
            .unwrap();
        let id = session.id();
        assert_ne!(id, 42);
        session.close().await.unwrap();

        let bob = storage.stats.load_or_create(id).await.unwrap();
        assert_eq!(bob.receive_bytes, ("bob".len() + 1) as u64);
        let other = storage.stats.load_or_create(42).await.unwrap();
        assert_eq!(other.receive_bytes, 0);
    }

    #[tokio::test]
    async fn rejected_init_does_not_overwrite_saved_totals() {
        let storage = RelayStorage::in_memory();
        let registry = ConnectionCache::new();
        let init_42 = || Message::new(Command::InitById, "42", SERVER_ID, ["42", "0"]);

        let first = counter_in(&storage, &registry, 1, quota_validator(0, 0));
        first.write(init_42()).await.unwrap();
        first
            .write(Message::new(Command::Ping, "42", SERVER_ID, ["0123456789"]))
            .await
            .unwrap();

        let second = counter_in(&storage, &registry, 2, quota_validator(0, 0));
        let err = second.write(init_42()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientExist);

        first.close().await.unwrap();
        assert_eq!(storage.stats.load_or_create(42).await.unwrap().receive_bytes, 13);

        second.write(init_42()).await.unwrap();
        second.close().await.unwrap();
        // Both init attempts of the second session land on top of the first's total.
        assert_eq!(storage.stats.load_or_create(42).await.unwrap().receive_bytes, 19);
    }
}
