//! In-memory bucket engine.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use super::bucket::{BucketStore, u64_key};
use super::error::StorageResult;

#[derive(Debug, Default)]
struct MemoryBucket {
    sequence: u64,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// Non-durable [`BucketStore`] for tests and ephemeral deployments.
///
/// Each bucket lives behind its own DashMap shard entry, which serializes
/// operations on that bucket.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<Vec<u8>, MemoryBucket>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held in `bucket`.
    pub fn len(&self, bucket: &[u8]) -> usize {
        self.buckets
            .get(bucket)
            .map(|b| b.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn next_sequence(&self, bucket: &[u8]) -> StorageResult<u64> {
        let mut entry = self.buckets.entry(bucket.to_vec()).or_default();
        entry.sequence += 1;
        Ok(entry.sequence)
    }

    async fn append(&self, bucket: &[u8], value: Vec<u8>) -> StorageResult<u64> {
        let mut entry = self.buckets.entry(bucket.to_vec()).or_default();
        entry.sequence += 1;
        let seq = entry.sequence;
        entry.entries.insert(u64_key(seq).to_vec(), value);
        Ok(seq)
    }

    async fn put(&self, bucket: &[u8], key: &[u8], value: Vec<u8>) -> StorageResult<()> {
        self.buckets
            .entry(bucket.to_vec())
            .or_default()
            .entries
            .insert(key.to_vec(), value);
        Ok(())
    }

    async fn get(&self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .get(bucket)
            .and_then(|b| b.entries.get(key).cloned()))
    }

    async fn first(&self, bucket: &[u8]) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self.buckets.get(bucket).and_then(|b| {
            b.entries
                .first_key_value()
                .map(|(k, v)| (k.clone(), v.clone()))
        }))
    }

    async fn delete(&self, bucket: &[u8], key: &[u8]) -> StorageResult<()> {
        if let Some(mut b) = self.buckets.get_mut(bucket) {
            b.entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::bucket::key_u64;

    #[tokio::test]
    async fn append_assigns_increasing_sequences() {
        let store = MemoryBucketStore::new();
        assert_eq!(store.append(b"a", b"x".to_vec()).await.unwrap(), 1);
        assert_eq!(store.append(b"a", b"y".to_vec()).await.unwrap(), 2);
        assert_eq!(store.append(b"b", b"z".to_vec()).await.unwrap(), 1);
        assert_eq!(store.len(b"a"), 2);
    }

    #[tokio::test]
    async fn first_returns_lowest_key() {
        let store = MemoryBucketStore::new();
        store.append(b"q", b"one".to_vec()).await.unwrap();
        store.append(b"q", b"two".to_vec()).await.unwrap();

        let (key, value) = store.first(b"q").await.unwrap().unwrap();
        assert_eq!(key_u64(&key), Some(1));
        assert_eq!(value, b"one");

        store.delete(b"q", &key).await.unwrap();
        let (key, _) = store.first(b"q").await.unwrap().unwrap();
        assert_eq!(key_u64(&key), Some(2));
    }

    #[tokio::test]
    async fn sequence_survives_deletes() {
        let store = MemoryBucketStore::new();
        let seq = store.append(b"q", b"v".to_vec()).await.unwrap();
        store.delete(b"q", &u64_key(seq)).await.unwrap();
        assert!(store.first(b"q").await.unwrap().is_none());
        assert_eq!(store.append(b"q", b"w".to_vec()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_bucket_reads_empty() {
        let store = MemoryBucketStore::new();
        assert!(store.get(b"none", b"k").await.unwrap().is_none());
        assert!(store.first(b"none").await.unwrap().is_none());
        store.delete(b"none", b"k").await.unwrap();
    }
}
