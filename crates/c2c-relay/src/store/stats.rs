//! Per-client traffic counters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bucket::{BucketStore, u64_key};
use super::error::{StorageError, StorageResult};

const STATS_BUCKET: &[u8] = b"stats";

/// Cumulative byte counters for one client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStat {
    pub id: u64,
    /// Bytes the client sent to the server.
    pub receive_bytes: u64,
    /// Bytes the server delivered to the client.
    pub transmit_bytes: u64,
}

/// Ledger of [`ClientStat`] records in the `stats` bucket.
#[derive(Clone)]
pub struct StatStore {
    engine: Arc<dyn BucketStore>,
}

impl StatStore {
    pub fn new(engine: Arc<dyn BucketStore>) -> Self {
        Self { engine }
    }

    /// Load the stored record for `id`, or a zeroed one.
    pub async fn load_or_create(&self, id: u64) -> StorageResult<ClientStat> {
        match self.engine.get(STATS_BUCKET, &u64_key(id)).await? {
            Some(body) => serde_json::from_slice(&body)
                .map_err(|e| StorageError::deserialization(STATS_BUCKET, e.to_string())),
            None => Ok(ClientStat {
                id,
                ..ClientStat::default()
            }),
        }
    }

    pub async fn save(&self, stat: &ClientStat) -> StorageResult<()> {
        let body =
            serde_json::to_vec(stat).map_err(|e| StorageError::serialization(e.to_string()))?;
        self.engine.put(STATS_BUCKET, &u64_key(stat.id), body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBucketStore;

    #[tokio::test]
    async fn missing_record_starts_at_zero() {
        let stats = StatStore::new(Arc::new(MemoryBucketStore::new()));
        let stat = stats.load_or_create(5).await.unwrap();
        assert_eq!(
            stat,
            ClientStat {
                id: 5,
                receive_bytes: 0,
                transmit_bytes: 0
            }
        );
    }

    #[tokio::test]
    async fn saved_record_is_reloaded() {
        let stats = StatStore::new(Arc::new(MemoryBucketStore::new()));
        let stat = ClientStat {
            id: 5,
            receive_bytes: 10,
            transmit_bytes: 20,
        };
        stats.save(&stat).await.unwrap();
        assert_eq!(stats.load_or_create(5).await.unwrap(), stat);
    }
}
