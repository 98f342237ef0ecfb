//! Process-wide connection cache.
//!
//! Maps client IDs (and names) of live sessions to their handles. Injected
//! into the factory and every session; cheap to clone.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::handle::SessionHandle;
use crate::error::{RelayError, RelayResult};

#[derive(Clone, Default)]
pub struct ConnectionCache {
    by_id: Arc<DashMap<u64, SessionHandle>>,
    by_name: Arc<DashMap<String, u64>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session.
    ///
    /// Fails with `ClientExist` if the ID or name is already registered; the
    /// existing entry is left untouched.
    pub fn add(&self, handle: SessionHandle) -> RelayResult<()> {
        let id = handle.id();
        let name = handle.name().to_string();

        match self.by_id.entry(id) {
            Entry::Occupied(_) => Err(RelayError::client_exists(id)),
            Entry::Vacant(slot) => {
                if !name.is_empty() {
                    match self.by_name.entry(name.clone()) {
                        Entry::Occupied(_) => return Err(RelayError::client_exists(&name)),
                        Entry::Vacant(name_slot) => {
                            name_slot.insert(id);
                        }
                    }
                }
                slot.insert(handle);
                debug!(client_id = id, name = %name, "Session registered");
                Ok(())
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<SessionHandle> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    /// ID of the live session registered under `name`.
    pub fn resolve_name(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).map(|entry| *entry.value())
    }

    /// Remove a registration. Missing IDs are ignored.
    pub fn delete(&self, id: u64) {
        if let Some((_, handle)) = self.by_id.remove(&id) {
            self.by_name.remove_if(handle.name(), |_, owner| *owner == id);
            debug!(client_id = id, "Session unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
