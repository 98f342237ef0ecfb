//! File-based bucket engine.
//!
//! Directory structure:
//! ```text
//! {root}/
//!   {hex(bucket)}/
//!     .sequence          # last allocated sequence, decimal text
//!     {hex(key)}         # one file per entry
//! ```
//!
//! Hex names keep lexical file order equal to key byte order. Every write goes
//! through a temp file and a rename, so a crash never leaves a torn entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::bucket::{BucketStore, u64_key};
use super::error::{StorageError, StorageResult};
use crate::sync::KeyedLocks;

const SEQUENCE_FILE: &str = ".sequence";
const TEMP_SUFFIX: &str = ".tmp";

/// Durable [`BucketStore`] on the local filesystem.
#[derive(Clone)]
pub struct FileBucketStore {
    root: PathBuf,
    locks: KeyedLocks,
}

impl FileBucketStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new("bucket"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    async fn ensure_dir(&self, dir: &Path) -> StorageResult<()> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::file_io(dir, e))
    }

    async fn read_sequence(&self, dir: &Path) -> StorageResult<u64> {
        let path = dir.join(SEQUENCE_FILE);
        match fs::read_to_string(&path).await {
            Ok(text) => text
                .trim()
                .parse()
                .map_err(|e| StorageError::file_corrupt(&path, format!("{e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::file_io(&path, e)),
        }
    }

    /// Bump the bucket sequence. Caller holds the bucket lock.
    async fn bump_sequence(&self, dir: &Path) -> StorageResult<u64> {
        self.ensure_dir(dir).await?;
        let next = self.read_sequence(dir).await? + 1;
        write_atomic(&dir.join(SEQUENCE_FILE), next.to_string().as_bytes()).await?;
        Ok(next)
    }
}

#[async_trait]
impl BucketStore for FileBucketStore {
    async fn next_sequence(&self, bucket: &[u8]) -> StorageResult<u64> {
        let name = encode_hex(bucket);
        let _guard = self.locks.lock(&name).await;
        self.bump_sequence(&self.bucket_dir(&name)).await
    }

    async fn append(&self, bucket: &[u8], value: Vec<u8>) -> StorageResult<u64> {
        let name = encode_hex(bucket);
        let _guard = self.locks.lock(&name).await;
        let dir = self.bucket_dir(&name);

        let seq = self.bump_sequence(&dir).await?;
        write_atomic(&dir.join(encode_hex(&u64_key(seq))), &value).await?;
        Ok(seq)
    }

    async fn put(&self, bucket: &[u8], key: &[u8], value: Vec<u8>) -> StorageResult<()> {
        let name = encode_hex(bucket);
        let _guard = self.locks.lock(&name).await;
        let dir = self.bucket_dir(&name);

        self.ensure_dir(&dir).await?;
        write_atomic(&dir.join(encode_hex(key)), &value).await
    }

    async fn get(&self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let name = encode_hex(bucket);
        let _guard = self.locks.lock(&name).await;
        read_optional(&self.bucket_dir(&name).join(encode_hex(key))).await
    }

    async fn first(&self, bucket: &[u8]) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        let name = encode_hex(bucket);
        let _guard = self.locks.lock(&name).await;
        let dir = self.bucket_dir(&name);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::file_io(&dir, e)),
        };

        let mut lowest: Option<String> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::file_io(&dir, e))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            // Skip the sequence file and abandoned temp files
            if file_name.starts_with('.') || file_name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            if lowest.as_deref().is_none_or(|current| file_name.as_str() < current) {
                lowest = Some(file_name);
            }
        }

        let Some(file_name) = lowest else {
            return Ok(None);
        };
        let path = dir.join(&file_name);
        let key = decode_hex(&file_name)
            .ok_or_else(|| StorageError::file_corrupt(&path, "entry name is not hex"))?;
        let value = read_optional(&path)
            .await?
            .ok_or_else(|| StorageError::file_corrupt(&path, "entry vanished under lock"))?;
        Ok(Some((key, value)))
    }

    async fn delete(&self, bucket: &[u8], key: &[u8]) -> StorageResult<()> {
        let name = encode_hex(bucket);
        let _guard = self.locks.lock(&name).await;
        let path = self.bucket_dir(&name).join(encode_hex(key));

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::file_io(&path, e)),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn write_atomic(path: &Path, contents: &[u8]) -> StorageResult<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(TEMP_SUFFIX);
    let temp_path = PathBuf::from(temp_name);

    fs::write(&temp_path, contents)
        .await
        .map_err(|e| StorageError::file_io(&temp_path, e))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| StorageError::file_io(path, e))
}

async fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::file_io(path, e)),
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::bucket::key_u64;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileBucketStore) {
        let tmp = TempDir::new().unwrap();
        let store = FileBucketStore::new(tmp.path().join("buckets"));
        (tmp, store)
    }

    #[test]
    fn hex_preserves_byte_order() {
        assert_eq!(encode_hex(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(decode_hex("00ab10"), Some(vec![0x00, 0xab, 0x10]));
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("zz"), None);
        assert!(encode_hex(&u64_key(9)) < encode_hex(&u64_key(10)));
    }

    #[tokio::test]
    async fn append_and_first_follow_sequence_order() {
        let (_tmp, store) = store();
        for i in 0..12u8 {
            store.append(b"inbox", vec![i]).await.unwrap();
        }

        let (key, value) = store.first(b"inbox").await.unwrap().unwrap();
        assert_eq!(key_u64(&key), Some(1));
        assert_eq!(value, vec![0]);
    }

    #[tokio::test]
    async fn sequence_persists_across_instances() {
        let (tmp, store) = store();
        store.append(b"q", b"a".to_vec()).await.unwrap();
        store.append(b"q", b"b".to_vec()).await.unwrap();
        store.delete(b"q", &u64_key(2)).await.unwrap();

        let reopened = FileBucketStore::new(tmp.path().join("buckets"));
        assert_eq!(reopened.append(b"q", b"c".to_vec()).await.unwrap(), 3);
        assert_eq!(reopened.next_sequence(b"q").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn put_get_delete() {
        let (_tmp, store) = store();
        store.put(b"clients", b"alice", b"v1".to_vec()).await.unwrap();
        store.put(b"clients", b"alice", b"v2".to_vec()).await.unwrap();
        assert_eq!(
            store.get(b"clients", b"alice").await.unwrap(),
            Some(b"v2".to_vec())
        );

        store.delete(b"clients", b"alice").await.unwrap();
        store.delete(b"clients", b"alice").await.unwrap();
        assert!(store.get(b"clients", b"alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_skips_sequence_and_temp_files() {
        let (_tmp, store) = store();
        store.next_sequence(b"q").await.unwrap();
        let dir = store.root().join(encode_hex(b"q"));
        fs::write(dir.join(format!("00{TEMP_SUFFIX}")), b"junk")
            .await
            .unwrap();

        assert!(store.first(b"q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_root_reads_empty() {
        let (_tmp, store) = store();
        assert!(store.first(b"nothing").await.unwrap().is_none());
        assert!(store.get(b"nothing", b"k").await.unwrap().is_none());
    }
}
