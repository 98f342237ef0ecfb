//! Ordered-bucket key-value engine.
//!
//! A bucket is a named, byte-ordered map with its own monotonic sequence.
//! Higher-level stores (message queue, traffic stats, client directory) are
//! built on this trait so they work with any engine.

use async_trait::async_trait;

use super::error::StorageResult;

/// A durable ordered store of buckets.
///
/// Implementations serialize operations on one bucket; different buckets may
/// proceed in parallel.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Allocate the next sequence value of `bucket`, starting at 1.
    ///
    /// Values are never handed out twice, even after the entries using them are deleted.
    async fn next_sequence(&self, bucket: &[u8]) -> StorageResult<u64>;

    /// Allocate a sequence and store `value` under its big-endian key, atomically.
    async fn append(&self, bucket: &[u8], value: Vec<u8>) -> StorageResult<u64>;

    /// Insert or replace an entry.
    async fn put(&self, bucket: &[u8], key: &[u8], value: Vec<u8>) -> StorageResult<()>;

    async fn get(&self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// The entry with the lowest key, if any.
    async fn first(&self, bucket: &[u8]) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>>;

    /// Remove an entry. Removing a missing entry is not an error.
    async fn delete(&self, bucket: &[u8], key: &[u8]) -> StorageResult<()>;
}

/// 8-byte big-endian key for `n`, so byte order equals numeric order.
pub fn u64_key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Inverse of [`u64_key`].
pub fn key_u64(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
