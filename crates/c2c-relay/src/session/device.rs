//! Device session: the base actor behind every client connection.
//!
//! Owns the client's inbound queue and subscriber map and dispatches the
//! command protocol. Relay traffic goes straight into a target's inbound queue
//! when the target is registered, and into the store-and-forward queue
//! otherwise.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use c2c_protocol::{ClientDescriptor, Command, ErrorKind, Message, SERVER_ID};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::handle::{SessionHandle, SessionShared};
use super::inbound::{InboundReceiver, inbound_queue};
use super::registry::ConnectionCache;
use super::types::{ClientSession, ReadEvent, ReadHandler};
use crate::config::{DEFAULT_MAX_QUEUE_PACKET_SIZE, RelayConfig};
use crate::error::{RelayError, RelayResult};
use crate::store::{ClientRecord, MAX_NAME_LEN, RelayStorage};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// `0` disables `register` and `generate` and allows password-less identities.
    pub client_type: u32,
    pub queue_capacity: usize,
}

impl DeviceConfig {
    pub fn from_relay(relay: &RelayConfig) -> Self {
        Self {
            client_type: relay.client_type(),
            queue_capacity: relay.max_queue_packet_size(),
        }
    }

    fn registration_enabled(&self) -> bool {
        self.client_type != 0
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            client_type: 0,
            queue_capacity: DEFAULT_MAX_QUEUE_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addressing {
    Id,
    Name,
}

enum ReadState {
    Waiting,
    Delivered(Message),
    TimedOut,
    Closed,
}

// ============================================================================
// DeviceSession
// ============================================================================

pub struct DeviceSession {
    session_id: u32,
    config: DeviceConfig,
    registry: ConnectionCache,
    storage: RelayStorage,
    shared: Arc<SessionShared>,
    inbound: Mutex<InboundReceiver>,
    identity: RwLock<Option<SessionHandle>>,
    closed: AtomicBool,
}

impl DeviceSession {
    pub fn new(
        session_id: u32,
        config: DeviceConfig,
        registry: ConnectionCache,
        storage: RelayStorage,
    ) -> Self {
        let (sender, receiver) = inbound_queue(config.queue_capacity);
        Self {
            session_id,
            config,
            registry,
            storage,
            shared: Arc::new(SessionShared::new(sender)),
            inbound: Mutex::new(receiver),
            identity: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Identity, once established.
    pub fn descriptor(&self) -> Option<ClientDescriptor> {
        self.current().map(|h| h.descriptor().clone())
    }

    fn current(&self) -> Option<SessionHandle> {
        self.identity.read().clone()
    }

    fn require_identity(&self, command: Command) -> RelayResult<SessionHandle> {
        self.current().ok_or_else(|| {
            RelayError::bad_command(format!(
                "{command} before init in session {}",
                self.session_id
            ))
        })
    }

    /// Queue a server message for this client.
    async fn reply(&self, msg: Message) -> RelayResult<()> {
        self.shared.sender().send(msg).await.map_err(|_| {
            RelayError::internal(format!(
                "inbound queue of session {} is closed",
                self.session_id
            ))
        })
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    /// Establish the session identity and register it.
    ///
    /// Re-establishing the identity the session already holds is a no-op.
    async fn establish(
        &self,
        from: &str,
        addressing: Addressing,
        hash: Option<&str>,
    ) -> RelayResult<SessionHandle> {
        if let Some(current) = self.current() {
            let same = match addressing {
                Addressing::Id => from.trim().parse::<u64>().ok() == Some(current.id()),
                Addressing::Name => current.name() == from,
            };
            if same {
                return Ok(current);
            }
            return Err(RelayError::bad_command(format!(
                "session {} is already bound to client {}",
                self.session_id,
                current.id()
            )));
        }

        let descriptor = match addressing {
            Addressing::Id => self.identify_by_id(parse_id(from)?, hash).await?,
            Addressing::Name => self.identify_by_name(from, hash).await?,
        };

        let handle = SessionHandle::new(descriptor, self.shared.clone());
        self.registry.add(handle.clone())?;
        *self.identity.write() = Some(handle.clone());

        info!(
            session_id = self.session_id,
            client_id = handle.id(),
            name = %handle.name(),
            "Client initialized"
        );
        Ok(handle)
    }

    async fn identify_by_id(&self, id: u64, hash: Option<&str>) -> RelayResult<ClientDescriptor> {
        let record = self.storage.directory.find_by_id(id).await?;
        let descriptor = match self.check_record(record, &id.to_string(), hash)? {
            Some(record) => ClientDescriptor::new(record.id, record.name),
            None => ClientDescriptor::new(id, id.to_string()),
        };
        Ok(descriptor)
    }

    async fn identify_by_name(
        &self,
        name: &str,
        hash: Option<&str>,
    ) -> RelayResult<ClientDescriptor> {
        check_name(name)?;
        let record = self.storage.directory.find_by_name(name).await?;
        let record = match self.check_record(record, name, hash)? {
            Some(record) => record,
            None => self.storage.directory.claim(name).await?,
        };
        Ok(ClientDescriptor::new(record.id, record.name))
    }

    /// Apply the credential policy to a directory lookup.
    ///
    /// With registration enabled a record is mandatory and must accept the
    /// presented hash. Otherwise a hash is only checked when both sides have one.
    fn check_record(
        &self,
        record: Option<ClientRecord>,
        who: &str,
        hash: Option<&str>,
    ) -> RelayResult<Option<ClientRecord>> {
        let Some(record) = record else {
            if self.config.registration_enabled() {
                return Err(RelayError::client_not_found(who));
            }
            return Ok(None);
        };

        let accepted = if self.config.registration_enabled() {
            record.accepts(hash)
        } else {
            hash.is_none() || record.password_hash.is_empty() || record.accepts(hash)
        };
        if !accepted {
            return Err(RelayError::invalid_credentials(who));
        }
        Ok(Some(record))
    }

    async fn resolve_name(&self, name: &str) -> RelayResult<u64> {
        check_name(name)?;
        if let Some(id) = self.registry.resolve_name(name) {
            return Ok(id);
        }
        match self.storage.directory.find_by_name(name).await? {
            Some(record) => Ok(record.id),
            None => Err(RelayError::client_not_found(name)),
        }
    }

    async fn resolve_target(&self, target: &str, addressing: Addressing) -> RelayResult<u64> {
        match addressing {
            Addressing::Id => parse_id(target),
            Addressing::Name => self.resolve_name(target).await,
        }
    }

    /// Numeric addresses are IDs; anything else is a name.
    async fn resolve_address(&self, target: &str) -> RelayResult<u64> {
        if target.trim().parse::<u64>().is_ok() {
            return parse_id(target);
        }
        self.resolve_name(target).await
    }

    // ------------------------------------------------------------------------
    // Command Handlers
    // ------------------------------------------------------------------------

    async fn ping(&self, msg: &Message) -> RelayResult<()> {
        self.reply(msg.reply(msg.content.clone())).await
    }

    async fn init(&self, msg: &Message, addressing: Addressing) -> RelayResult<()> {
        let from = field(msg, 0, "the client identifier")?;
        expect_server(msg)?;
        let me = self.establish(from, addressing, optional_hash(msg)).await?;
        self.reply(ack(msg, me.descriptor())).await
    }

    async fn connect(&self, msg: &Message, addressing: Addressing) -> RelayResult<()> {
        let from = field(msg, 0, "the source client")?;
        let to = field(msg, 1, "the target client")?;

        // The target must be online before the caller takes an identity
        let target_id = self.resolve_target(to, addressing).await?;
        let target = self
            .registry
            .get(target_id)
            .ok_or_else(|| RelayError::client_not_found(to))?;

        let me = self.establish(from, addressing, None).await?;
        if target_id == me.id() {
            return Err(RelayError::bad_command(format!(
                "client {} cannot connect to itself",
                me.id()
            )));
        }

        target.add_listener(me.id(), Some(me.sender()));
        me.add_listener(target.id(), Some(target.sender()));
        info!(
            session_id = self.session_id,
            client_id = me.id(),
            peer_id = target.id(),
            "Clients connected"
        );

        self.reply(msg.reply([
            me.id().to_string(),
            me.name().to_string(),
            target.id().to_string(),
            target.name().to_string(),
        ]))
        .await
    }

    async fn register(&self, msg: &Message) -> RelayResult<()> {
        let name = field(msg, 0, "the client name")?;
        check_name(name)?;
        expect_server(msg)?;
        let hash = optional_hash(msg)
            .ok_or_else(|| RelayError::bad_command("register requires a password hash"))?;

        let record = self.storage.directory.register(name, hash).await?;
        self.reply(ack(msg, &ClientDescriptor::new(record.id, record.name)))
            .await
    }

    async fn generate(&self, msg: &Message) -> RelayResult<()> {
        expect_server(msg)?;
        let hash = optional_hash(msg)
            .ok_or_else(|| RelayError::bad_command("generate requires a password hash"))?;

        let record = self.storage.directory.generate(hash).await?;
        self.reply(ack(msg, &ClientDescriptor::new(record.id, record.name)))
            .await
    }

    async fn relay(&self, msg: Message) -> RelayResult<()> {
        let me = self.require_identity(msg.command)?;
        let to = field(&msg, 1, "the target client")?.to_string();
        field(&msg, 2, "the payload")?;

        if to.is_empty() {
            return self.fan_out(&me, msg).await;
        }

        let target = self.resolve_address(&to).await?;
        if target == me.id() {
            return Err(RelayError::bad_command(format!(
                "client {} cannot send to itself",
                me.id()
            )));
        }
        self.deliver(target, msg).await
    }

    /// Enqueue into a live target, or persist when it is absent or closed.
    async fn deliver(&self, target: u64, msg: Message) -> RelayResult<()> {
        let msg = match self.registry.get(target) {
            Some(handle) => match handle.sender().send(msg).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(client_id = target, "Target queue closed, falling back to store");
                    e.into_inner()
                }
            },
            None => msg,
        };

        let message_id = self.storage.queue.add(target, &msg).await?;
        debug!(
            session_id = self.session_id,
            client_id = target,
            message_id = message_id,
            "Message stored for offline client"
        );
        Ok(())
    }

    async fn fan_out(&self, me: &SessionHandle, msg: Message) -> RelayResult<()> {
        let listeners = me.listeners();
        if listeners.is_empty() {
            return Err(RelayError::new(
                ErrorKind::ClientNotFind,
                format!("client {} has no subscribers", me.id()),
            ));
        }

        for (peer, sender) in listeners {
            if let Err(e) = sender.send(msg.clone()).await {
                me.del_listener(peer);
                let message_id = self.storage.queue.add(peer, &e.into_inner()).await?;
                debug!(
                    client_id = peer,
                    message_id = message_id,
                    "Subscriber gone, message stored"
                );
            }
        }
        Ok(())
    }

    async fn destroy_connection(&self, msg: &Message) -> RelayResult<()> {
        let me = self.require_identity(msg.command)?;
        let target = msg.content_at(1).unwrap_or(SERVER_ID);
        let removed = self.detach(&me, target).await?;
        self.reply(msg.reply([me.id().to_string(), removed.to_string()]))
            .await
    }

    /// Unlink `me` from `target` ("0" or "" for every peer). Returns the number of links removed.
    async fn detach(&self, me: &SessionHandle, target: &str) -> RelayResult<usize> {
        let peers: Vec<u64> = if target.is_empty() || target == SERVER_ID {
            me.listeners().into_iter().map(|(id, _)| id).collect()
        } else {
            vec![self.resolve_address(target).await?]
        };

        let mut removed = 0;
        for peer in peers {
            let mut linked = me.del_listener(peer).is_some();
            if let Some(peer_handle) = self.registry.get(peer) {
                linked |= peer_handle.del_listener(me.id()).is_some();
                if linked {
                    let notice = Message::new(
                        Command::DestroyConnection,
                        me.id().to_string(),
                        peer.to_string(),
                        [me.id().to_string(), peer.to_string()],
                    );
                    if let Err(e) = peer_handle.sender().try_send(notice) {
                        debug!(peer_id = peer, error = %e, "Peer not notified of unlink");
                    }
                }
            }
            if linked {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn properties(&self, msg: &Message) -> RelayResult<()> {
        self.shared
            .set_properties(msg.content.iter().skip(2).cloned().collect());
        let descriptor = self.descriptor().unwrap_or_default();
        self.reply(ack(msg, &descriptor)).await
    }

    fn upstream_error(&self, msg: &Message) -> RelayResult<()> {
        warn!(
            session_id = self.session_id,
            client_id = self.id(),
            content = ?msg.content,
            "Client reported an error"
        );
        Ok(())
    }
}

#[async_trait]
impl ClientSession for DeviceSession {
    async fn write(&self, msg: Message) -> RelayResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::internal(format!(
                "session {} is closed",
                self.session_id
            )));
        }

        match msg.command {
            Command::Error => self.upstream_error(&msg),
            Command::Ping => self.ping(&msg).await,
            Command::ConnectById => self.connect(&msg, Addressing::Id).await,
            Command::ConnectByName => self.connect(&msg, Addressing::Name).await,
            Command::InitById => self.init(&msg, Addressing::Id).await,
            Command::InitByName => self.init(&msg, Addressing::Name).await,
            Command::Register if self.config.registration_enabled() => self.register(&msg).await,
            Command::Generate if self.config.registration_enabled() => self.generate(&msg).await,
            Command::Register | Command::Generate => Err(RelayError::unsupported(format!(
                "{}: registration is disabled on this server",
                msg.command
            ))),
            Command::Data => self.relay(msg).await,
            Command::DestroyConnection => self.destroy_connection(&msg).await,
            Command::Properties => self.properties(&msg).await,
            Command::Unknown => Err(RelayError::unsupported(format!(
                "in session {}",
                self.session_id
            ))),
        }
    }

    async fn read(&self, timeout: Duration, handler: &mut dyn ReadHandler) {
        let mut inbound = self.inbound.lock().await;
        let timer = sleep(timeout);
        tokio::pin!(timer);

        let mut state = ReadState::Waiting;
        loop {
            state = match state {
                ReadState::Waiting => tokio::select! {
                    msg = inbound.recv() => match msg {
                        Some(msg) => ReadState::Delivered(msg),
                        None => ReadState::Closed,
                    },
                    () = &mut timer => ReadState::TimedOut,
                },
                ReadState::Delivered(msg) => {
                    if handler.handle(ReadEvent::Message(msg)).await.is_break() {
                        return;
                    }
                    ReadState::Waiting
                }
                ReadState::TimedOut => {
                    // The timer only restarts on expiry; deliveries do not push it back
                    timer.as_mut().reset(Instant::now() + timeout);
                    let timeout_error = RelayError::read_timeout(self.session_id);
                    if handler.handle(ReadEvent::Timeout(timeout_error)).await.is_break() {
                        return;
                    }
                    ReadState::Waiting
                }
                ReadState::Closed => {
                    debug!(session_id = self.session_id, "Inbound queue closed");
                    let _ = handler.handle(ReadEvent::Eof).await;
                    return;
                }
            };
        }
    }

    async fn close(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let identity = self.identity.write().take();
        if let Some(me) = identity {
            if let Err(e) = self.detach(&me, SERVER_ID).await {
                warn!(session_id = self.session_id, error = %e, "Failed to unlink peers on close");
            }
            self.registry.delete(me.id());
            info!(
                session_id = self.session_id,
                client_id = me.id(),
                name = %me.name(),
                "Client closed"
            );
        }

        self.shared.sender().close();
        Ok(())
    }

    fn id(&self) -> u64 {
        self.identity.read().as_ref().map_or(0, SessionHandle::id)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn field<'a>(msg: &'a Message, index: usize, what: &str) -> RelayResult<&'a str> {
    msg.content_at(index).ok_or_else(|| {
        RelayError::bad_command(format!(
            "{} requires {what} in content[{index}]",
            msg.command
        ))
    })
}

fn expect_server(msg: &Message) -> RelayResult<()> {
    let to = field(msg, 1, "the server address")?;
    if to != SERVER_ID {
        return Err(RelayError::bad_command(format!(
            "{} must be addressed to the server, got '{to}'",
            msg.command
        )));
    }
    Ok(())
}

fn check_name(name: &str) -> RelayResult<()> {
    if name.is_empty() {
        return Err(RelayError::bad_command("client name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RelayError::bad_command(format!(
            "client name is longer than {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

fn optional_hash(msg: &Message) -> Option<&str> {
    msg.content_at(2).filter(|hash| !hash.is_empty())
}

fn parse_id(text: &str) -> RelayResult<u64> {
    let id: u64 = text
        .trim()
        .parse()
        .map_err(|_| RelayError::bad_command(format!("'{text}' is not a client ID")))?;
    if id == 0 {
        return Err(RelayError::bad_command("client ID 0 is the server"));
    }
    Ok(id)
}

fn ack(msg: &Message, descriptor: &ClientDescriptor) -> Message {
    msg.reply([descriptor.id.to_string(), descriptor.name.clone()])
}
