//! Registered client credentials.
//!
//! Records live in the `clients` bucket keyed by name; `client_ids` maps the
//! 8-byte big-endian ID back to the name and owns the ID sequence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::bucket::{BucketStore, u64_key};
use super::error::{StorageError, StorageResult};
use crate::sync::KeyedLocks;

const CLIENTS_BUCKET: &[u8] = b"clients";
const CLIENT_IDS_BUCKET: &[u8] = b"client_ids";

/// Longest client name in bytes. Hex-encoded plus a temp suffix it still fits a
/// 255-byte file name.
pub const MAX_NAME_LEN: usize = 125;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: u64,
    pub name: String,
    /// Empty for identities claimed without a password.
    #[serde(default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ClientRecord {
    /// Check a presented hash. An absent hash only passes for password-less records.
    pub fn accepts(&self, hash: Option<&str>) -> bool {
        match hash {
            Some(hash) => self.password_hash == hash,
            None => self.password_hash.is_empty(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("credentials do not match the record for {0}")]
    InvalidCredentials(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Name/ID directory of known clients.
#[derive(Clone)]
pub struct ClientDirectory {
    engine: Arc<dyn BucketStore>,
    locks: KeyedLocks,
}

impl ClientDirectory {
    pub fn new(engine: Arc<dyn BucketStore>) -> Self {
        Self {
            engine,
            locks: KeyedLocks::new("client_directory"),
        }
    }

    /// Register `name` with `password_hash`.
    ///
    /// Re-registering with the same hash returns the existing record.
    pub async fn register(
        &self,
        name: &str,
        password_hash: &str,
    ) -> Result<ClientRecord, DirectoryError> {
        let _guard = self.locks.lock(name).await;

        if let Some(existing) = self.find_by_name(name).await? {
            if existing.password_hash == password_hash {
                return Ok(existing);
            }
            return Err(DirectoryError::InvalidCredentials(name.to_string()));
        }

        let id = self.allocate_id().await?;
        let record = self.insert(id, name.to_string(), password_hash).await?;
        info!(client_id = id, name = %name, "Client registered");
        Ok(record)
    }

    /// Allocate a fresh identity whose name is its decimal ID.
    pub async fn generate(&self, password_hash: &str) -> Result<ClientRecord, DirectoryError> {
        loop {
            let id = self.allocate_id().await?;
            let name = id.to_string();
            let _guard = self.locks.lock(&name).await;
            // A client may already have registered this decimal string as a name
            if self.find_by_name(&name).await?.is_some() {
                continue;
            }
            let record = self.insert(id, name, password_hash).await?;
            info!(client_id = id, "Client generated");
            return Ok(record);
        }
    }

    /// Return the record for `name`, creating a password-less one if absent.
    pub async fn claim(&self, name: &str) -> StorageResult<ClientRecord> {
        let _guard = self.locks.lock(name).await;
        if let Some(existing) = self.find_by_name(name).await? {
            return Ok(existing);
        }
        let id = self.allocate_id().await?;
        self.insert(id, name.to_string(), "").await
    }

    pub async fn find_by_name(&self, name: &str) -> StorageResult<Option<ClientRecord>> {
        let Some(body) = self.engine.get(CLIENTS_BUCKET, name.as_bytes()).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| StorageError::deserialization(CLIENTS_BUCKET, e.to_string()))
    }

    pub async fn find_by_id(&self, id: u64) -> StorageResult<Option<ClientRecord>> {
        let Some(name) = self.engine.get(CLIENT_IDS_BUCKET, &u64_key(id)).await? else {
            return Ok(None);
        };
        let name = String::from_utf8(name)
            .map_err(|e| StorageError::deserialization(CLIENT_IDS_BUCKET, e.to_string()))?;
        self.find_by_name(&name).await
    }

    /// Next unused ID from the `client_ids` sequence.
    async fn allocate_id(&self) -> StorageResult<u64> {
        loop {
            let id = self.engine.next_sequence(CLIENT_IDS_BUCKET).await?;
            if self.engine.get(CLIENT_IDS_BUCKET, &u64_key(id)).await?.is_none() {
                return Ok(id);
            }
        }
    }

    async fn insert(
        &self,
        id: u64,
        name: String,
        password_hash: &str,
    ) -> StorageResult<ClientRecord> {
        let record = ClientRecord {
            id,
            name,
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        let body =
            serde_json::to_vec(&record).map_err(|e| StorageError::serialization(e.to_string()))?;

        self.engine
            .put(CLIENTS_BUCKET, record.name.as_bytes(), body)
            .await?;
        self.engine
            .put(CLIENT_IDS_BUCKET, &u64_key(id), record.name.as_bytes().to_vec())
            .await?;
        Ok(record)
    }
}
