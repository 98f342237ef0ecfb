//! Unified error types for storage operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    // ========================================================================
    // File-based backend errors
    // ========================================================================
    /// I/O error during file operations.
    #[error("I/O error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file that does not hold what its name promises.
    #[error("corrupt entry at {path}: {message}")]
    FileCorrupt { path: PathBuf, message: String },

    // ========================================================================
    // Record errors (any backend)
    // ========================================================================
    /// Error serializing a record.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error decoding a stored record.
    #[error("deserialization error in bucket {bucket}: {message}")]
    Deserialization { bucket: String, message: String },
}

impl StorageError {
    /// Create a file I/O error with path context.
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }

    pub fn file_corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileCorrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a decoding error; the bucket name is rendered lossily.
    pub fn deserialization(bucket: &[u8], message: impl Into<String>) -> Self {
        Self::Deserialization {
            bucket: String::from_utf8_lossy(bucket).into_owned(),
            message: message.into(),
        }
    }
}

/// Convenience type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
