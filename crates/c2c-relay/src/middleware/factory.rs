//! Builds sessions with the configured decorator chain.

use std::sync::Arc;

use tracing::warn;

use super::reliable::ReliableDelivery;
use super::traffic::{TrafficCounter, Validator, quota_validator};
use crate::config::RelayConfig;
use crate::session::{ClientSession, ConnectionCache, DeviceConfig, DeviceSession};
use crate::store::RelayStorage;

/// Middleware name of [`ReliableDelivery`].
pub const SAFE: &str = "safe";
/// Middleware name of [`TrafficCounter`].
pub const LIMITS: &str = "limits";

/// Creates one session per connection.
///
/// Decorators wrap the device session in list order, so the last listed name
/// is the outermost layer.
#[derive(Clone)]
pub struct SessionFactory {
    device: DeviceConfig,
    middleware: Vec<String>,
    validator: Validator,
    registry: ConnectionCache,
    storage: RelayStorage,
}

impl SessionFactory {
    pub fn new(relay: &RelayConfig, registry: ConnectionCache, storage: RelayStorage) -> Self {
        Self {
            device: DeviceConfig::from_relay(relay),
            middleware: relay.middleware(),
            validator: quota_validator(relay.max_receive_bytes(), relay.max_transmit_bytes()),
            registry,
            storage,
        }
    }

    /// Replace the traffic validator used by `limits`.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn registry(&self) -> &ConnectionCache {
        &self.registry
    }

    pub fn storage(&self) -> &RelayStorage {
        &self.storage
    }

    pub fn create(&self, session_id: u32) -> Arc<dyn ClientSession> {
        let mut session: Box<dyn ClientSession> = Box::new(DeviceSession::new(
            session_id,
            self.device,
            self.registry.clone(),
            self.storage.clone(),
        ));

        for name in &self.middleware {
            session = match name.as_str() {
                SAFE => Box::new(ReliableDelivery::new(
                    session,
                    self.registry.clone(),
                    self.storage.queue.clone(),
                )),
                LIMITS => Box::new(TrafficCounter::new(
                    session,
                    self.storage.stats.clone(),
                    self.validator.clone(),
                )),
                unknown => {
                    warn!(session_id = session_id, middleware = unknown, "Unknown middleware ignored");
                    session
                }
            };
        }

        Arc::from(session)
    }
}
