//! Error type surfaced by session operations.

use c2c_protocol::{ErrorKind, FrameError, Message};
use thiserror::Error;

use crate::store::{DirectoryError, StorageError};

/// A classified relay failure.
///
/// The [`ErrorKind`] is the wire contract; the message is free text for logs
/// and the error response body.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RelayError {
    kind: ErrorKind,
    message: String,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn client_not_found(target: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::ClientNotFind, format!("client {target} not found"))
    }

    pub fn read_timeout(session_id: u32) -> Self {
        Self::new(
            ErrorKind::ReadTimeout,
            format!("no message within read timeout in session {session_id}"),
        )
    }

    pub fn client_exists(target: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::ClientExist, format!("client {target} already registered"))
    }

    pub fn unsupported(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::UnsupportedCommand, format!("unsupported command {what}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn bad_command(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadCommand, message)
    }

    pub fn invalid_credentials(name: &str) -> Self {
        Self::new(
            ErrorKind::InvalidCredentials,
            format!("credentials rejected for {name}"),
        )
    }

    pub fn traffic_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TrafficLimit, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the client must not retry against another server or peer.
    pub fn disables_retry(&self) -> bool {
        self.kind.disables_retry()
    }

    /// Wire representation addressed to `to`.
    pub fn to_message(&self, to: impl Into<String>) -> Message {
        Message::error(to, self.kind, self.message.clone())
    }
}

impl From<StorageError> for RelayError {
    fn from(e: StorageError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<DirectoryError> for RelayError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::InvalidCredentials(name) => Self::invalid_credentials(&name),
            DirectoryError::Storage(e) => e.into(),
        }
    }
}

impl From<FrameError> for RelayError {
    fn from(e: FrameError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Convenience alias for session results.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use c2c_protocol::Command;

    #[test]
    fn storage_errors_become_internal() {
        let err: RelayError = StorageError::serialization("boom").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.disables_retry());
    }

    #[test]
    fn frame_errors_keep_their_kind() {
        let err: RelayError = FrameError::Nil.into();
        assert_eq!(err.kind(), ErrorKind::NilMessage);
    }

    #[test]
    fn to_message_encodes_code_and_text() {
        let err = RelayError::client_not_found("bob");
        let msg = err.to_message("5");
        assert_eq!(msg.command, Command::Error);
        assert_eq!(msg.to, "5");
        assert_eq!(msg.content[0], "1");
        assert_eq!(msg.content[1], "client bob not found");
        assert!(!err.disables_retry());
    }
}
