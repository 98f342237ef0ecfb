//! Store-and-forward queue for offline recipients.
//!
//! Each recipient owns one bucket named by its 8-byte big-endian ID. Entry
//! keys are the bucket sequence, so the lowest key is the oldest message and
//! IDs are never reused.

use std::sync::Arc;

use async_trait::async_trait;
use c2c_protocol::{Command, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bucket::{BucketStore, key_u64, u64_key};
use super::error::{StorageError, StorageResult};

/// A persisted message waiting for its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsentMessage {
    /// Assigned from the entry key on read; not part of the stored body.
    #[serde(skip)]
    pub id: u64,
    pub from: String,
    pub to: String,
    pub command: Command,
    pub content: Vec<String>,
    pub jmp: i32,
    pub proto: i32,
    pub created_at: DateTime<Utc>,
}

impl UnsentMessage {
    fn from_message(msg: &Message) -> Self {
        Self {
            id: 0,
            from: msg.from.clone(),
            to: msg.to.clone(),
            command: msg.command,
            content: msg.content.clone(),
            jmp: msg.jmp,
            proto: msg.proto,
            created_at: Utc::now(),
        }
    }

    /// The wire message to deliver.
    pub fn to_message(&self) -> Message {
        Message {
            from: self.from.clone(),
            to: self.to.clone(),
            command: self.command,
            content: self.content.clone(),
            jmp: self.jmp,
            proto: self.proto,
        }
    }
}

/// Durable per-recipient FIFO.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Persist `msg` for `recipient`, returning its assigned ID.
    async fn add(&self, recipient: u64, msg: &Message) -> StorageResult<u64>;

    /// Oldest undelivered message, or `None` when the bucket is empty.
    async fn get_next(&self, recipient: u64) -> StorageResult<Option<UnsentMessage>>;

    /// Acknowledge delivery. Acknowledging twice is harmless.
    async fn is_sended(&self, recipient: u64, id: u64) -> StorageResult<()>;
}

/// [`MessageQueue`] over any [`BucketStore`].
#[derive(Clone)]
pub struct BucketMessageQueue {
    engine: Arc<dyn BucketStore>,
}

impl BucketMessageQueue {
    pub fn new(engine: Arc<dyn BucketStore>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageQueue for BucketMessageQueue {
    async fn add(&self, recipient: u64, msg: &Message) -> StorageResult<u64> {
        let body = serde_json::to_vec(&UnsentMessage::from_message(msg))
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        self.engine.append(&u64_key(recipient), body).await
    }

    async fn get_next(&self, recipient: u64) -> StorageResult<Option<UnsentMessage>> {
        let bucket = u64_key(recipient);
        let Some((key, body)) = self.engine.first(&bucket).await? else {
            return Ok(None);
        };

        let id = key_u64(&key)
            .ok_or_else(|| StorageError::deserialization(&bucket, "queue key is not a u64"))?;
        let mut message: UnsentMessage = serde_json::from_slice(&body)
            .map_err(|e| StorageError::deserialization(&bucket, e.to_string()))?;
        message.id = id;
        Ok(Some(message))
    }

    async fn is_sended(&self, recipient: u64, id: u64) -> StorageResult<()> {
        self.engine.delete(&u64_key(recipient), &u64_key(id)).await
    }
}
