//! Shared view of a registered session.
//!
//! `SessionHandle` is what other sessions see through the registry: the
//! identity, an enqueue-only sender, and the subscriber map. It is cheap to
//! clone (an `Arc` inside).

use std::collections::HashMap;
use std::sync::Arc;

use c2c_protocol::ClientDescriptor;
use parking_lot::RwLock;
use tracing::trace;

use super::inbound::MessageSender;

/// State shared between a session and every handle to it.
#[derive(Debug)]
pub(crate) struct SessionShared {
    sender: MessageSender,
    /// Subscriber ID → sender on the subscriber's inbound queue.
    subscribers: RwLock<HashMap<u64, MessageSender>>,
    properties: RwLock<Vec<String>>,
}

impl SessionShared {
    pub(crate) fn new(sender: MessageSender) -> Self {
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            properties: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn sender(&self) -> &MessageSender {
        &self.sender
    }

    pub(crate) fn set_properties(&self, properties: Vec<String>) {
        *self.properties.write() = properties;
    }
}

/// Handle to a session registered under a client identity.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    descriptor: ClientDescriptor,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub(crate) fn new(descriptor: ClientDescriptor, shared: Arc<SessionShared>) -> Self {
        Self { descriptor, shared }
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ClientDescriptor {
        &self.descriptor
    }

    /// Sender on this session's inbound queue.
    pub fn sender(&self) -> MessageSender {
        self.shared.sender.clone()
    }

    // ------------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------------

    /// Subscribe `from` to this session's fan-out. `None` is ignored.
    pub fn add_listener(&self, from: u64, sender: Option<MessageSender>) {
        let Some(sender) = sender else {
            return;
        };
        self.shared.subscribers.write().insert(from, sender);
        trace!(from = from, to = self.id(), "Listener added");
    }

    /// Unsubscribe `from`. Unknown subscribers are ignored.
    pub fn del_listener(&self, from: u64) -> Option<MessageSender> {
        let removed = self.shared.subscribers.write().remove(&from);
        if removed.is_some() {
            trace!(from = from, to = self.id(), "Listener removed");
        }
        removed
    }

    pub fn listeners(&self) -> Vec<(u64, MessageSender)> {
        self.shared
            .subscribers
            .read()
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.subscribers.read().len()
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    pub fn properties(&self) -> Vec<String> {
        self.shared.properties.read().clone()
    }
}
