//! Persistence for the relay.
//!
//! Everything durable sits on one ordered-bucket engine:
//! - per-recipient buckets for the store-and-forward queue
//! - `stats` for traffic counters
//! - `clients` / `client_ids` for the client directory

mod bucket;
mod clients;
mod error;
mod file;
mod memory;
mod queue;
mod stats;

use std::sync::Arc;

pub use bucket::{BucketStore, key_u64, u64_key};
pub use clients::{ClientDirectory, ClientRecord, DirectoryError, MAX_NAME_LEN};
pub use error::{StorageError, StorageResult};
pub use file::FileBucketStore;
pub use memory::MemoryBucketStore;
pub use queue::{BucketMessageQueue, MessageQueue, UnsentMessage};
pub use stats::{ClientStat, StatStore};

/// The stores a session needs, sharing one engine.
#[derive(Clone)]
pub struct RelayStorage {
    pub queue: Arc<dyn MessageQueue>,
    pub stats: StatStore,
    pub directory: ClientDirectory,
}

impl RelayStorage {
    pub fn new(engine: Arc<dyn BucketStore>) -> Self {
        Self {
            queue: Arc::new(BucketMessageQueue::new(engine.clone())),
            stats: StatStore::new(engine.clone()),
            directory: ClientDirectory::new(engine),
        }
    }

    /// Non-durable storage for tests and ephemeral servers.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBucketStore::new()))
    }
}
