//! Wire types for the c2c relay protocol.
//!
//! This crate defines the messages exchanged between c2c clients and the relay
//! server, the command set, and the stable error codes the server reports.
//! Use it to build clients or alternative transports in Rust.
//!
//! # Protocol Overview
//!
//! Frames are JSON Lines (one [`Message`] per line). Every message carries a
//! [`Command`] and a positional `content` list whose meaning depends on the
//! command:
//!
//! | Command             | content[0]      | content[1] | content[2]      |
//! |---------------------|-----------------|------------|-----------------|
//! | `ping`              |                 |            |                 |
//! | `connect_by_id`     | from ID         | to ID      |                 |
//! | `connect_by_name`   | from name       | to name    |                 |
//! | `init_by_id`        | from ID         | `"0"`      | password hash?  |
//! | `init_by_name`      | from name       | `"0"`      | password hash?  |
//! | `register`          | name            | `"0"`      | password hash   |
//! | `generate`          | `""`            | `"0"`      | password hash   |
//! | `data`              | from            | to         | payload         |
//! | `destroy_connection`| from            | target     |                 |
//! | `properties`        | from            | to         | properties...   |
//! | `error`             | code            | text       |                 |
//!
//! # Example: Minimal Client
//!
//! ```ignore
//! use c2c_protocol::{Command, Message, decode_frame, encode_frame};
//!
//! let hello = Message::new(Command::InitByName, "alice", SERVER_ID, ["alice", "0"]);
//! socket.write_all(encode_frame(&hello)?.as_bytes()).await?;
//!
//! let reply = decode_frame(&read_line(&mut socket).await?)?;
//! ```

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Address of the relay server itself in `to`/`content` fields.
pub const SERVER_ID: &str = "0";

/// Default hop/protocol metadata for messages that do not carry it.
pub const DEFAULT_HOP: i32 = 1;

fn default_hop() -> i32 {
    DEFAULT_HOP
}

// ============================================================================
// Commands
// ============================================================================

/// Commands understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Upstream error report, or an error response from the server.
    Error,
    /// Liveness check, echoed back to the sender.
    Ping,
    /// Link two clients by numeric ID.
    ConnectById,
    /// Link two clients by name.
    ConnectByName,
    /// Claim an identity by numeric ID.
    InitById,
    /// Claim an identity by name.
    InitByName,
    /// Register a named credential.
    Register,
    /// Allocate a fresh identity.
    Generate,
    /// Relay a payload to another client.
    Data,
    /// Drop a link without disconnecting.
    DestroyConnection,
    /// Advertise session properties.
    Properties,
    /// Any command this build does not know.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Error => "error",
            Command::Ping => "ping",
            Command::ConnectById => "connect_by_id",
            Command::ConnectByName => "connect_by_name",
            Command::InitById => "init_by_id",
            Command::InitByName => "init_by_name",
            Command::Register => "register",
            Command::Generate => "generate",
            Command::Data => "data",
            Command::DestroyConnection => "destroy_connection",
            Command::Properties => "properties",
            Command::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Identity of a connected client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub id: u64,
    pub name: String,
}

impl ClientDescriptor {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub command: Command,
    #[serde(default)]
    pub content: Vec<String>,
    /// Hop counter, forwarded untouched.
    #[serde(default = "default_hop")]
    pub jmp: i32,
    /// Protocol revision, forwarded untouched.
    #[serde(default = "default_hop")]
    pub proto: i32,
}

impl Message {
    /// Create a message with default hop/protocol metadata.
    pub fn new<I, S>(command: Command, from: impl Into<String>, to: impl Into<String>, content: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            from: from.into(),
            to: to.into(),
            command,
            content: content.into_iter().map(Into::into).collect(),
            jmp: DEFAULT_HOP,
            proto: DEFAULT_HOP,
        }
    }

    /// Build an error response addressed to `to`.
    ///
    /// Content is `[code, text]`.
    pub fn error(to: impl Into<String>, kind: ErrorKind, text: impl Into<String>) -> Self {
        Self::new(
            Command::Error,
            SERVER_ID,
            to,
            [kind.code().to_string(), text.into()],
        )
    }

    /// Build a server reply to this message with the same command.
    pub fn reply<I, S>(&self, content: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            from: SERVER_ID.to_string(),
            to: self.from.clone(),
            command: self.command,
            content: content.into_iter().map(Into::into).collect(),
            jmp: self.jmp,
            proto: self.proto,
        }
    }

    /// Positional content field, if present.
    pub fn content_at(&self, index: usize) -> Option<&str> {
        self.content.get(index).map(String::as_str)
    }

    /// Total payload size in bytes across all content fields.
    pub fn content_len(&self) -> usize {
        self.content.iter().map(String::len).sum()
    }
}

// ============================================================================
// Error Kinds
// ============================================================================

/// Stable error classification reported to clients.
///
/// Codes at or above [`ErrorKind::DisableConnectionErrorLimit`] are systemic:
/// retrying the same request against another server or peer is pointless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorKind {
    ClientNotFind = 1,
    ReadTimeout = 2,
    ClientExist = 3,
    UnsupportedCommand = 4,
    DisableConnectionErrorLimit = 5,
    Internal = 6,
    BadCommand = 7,
    InvalidCredentials = 8,
    BadMessage = 9,
    NilMessage = 10,
    TrafficLimit = 11,
}

impl ErrorKind {
    /// Numeric wire code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// True when the failure must not be retried elsewhere.
    pub fn disables_retry(self) -> bool {
        self.code() >= ErrorKind::DisableConnectionErrorLimit.code()
    }
}

impl From<ErrorKind> for u16 {
    fn from(kind: ErrorKind) -> Self {
        kind.code()
    }
}

impl TryFrom<u16> for ErrorKind {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        let kind = match code {
            1 => ErrorKind::ClientNotFind,
            2 => ErrorKind::ReadTimeout,
            3 => ErrorKind::ClientExist,
            4 => ErrorKind::UnsupportedCommand,
            5 => ErrorKind::DisableConnectionErrorLimit,
            6 => ErrorKind::Internal,
            7 => ErrorKind::BadCommand,
            8 => ErrorKind::InvalidCredentials,
            9 => ErrorKind::BadMessage,
            10 => ErrorKind::NilMessage,
            11 => ErrorKind::TrafficLimit,
            other => return Err(format!("unknown error code {other}")),
        };
        Ok(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ClientNotFind => "client not found",
            ErrorKind::ReadTimeout => "read timeout",
            ErrorKind::ClientExist => "client already exists",
            ErrorKind::UnsupportedCommand => "unsupported command",
            ErrorKind::DisableConnectionErrorLimit => "connection error limit",
            ErrorKind::Internal => "internal error",
            ErrorKind::BadCommand => "bad command",
            ErrorKind::InvalidCredentials => "invalid credentials",
            ErrorKind::BadMessage => "bad message",
            ErrorKind::NilMessage => "nil message",
            ErrorKind::TrafficLimit => "traffic limit exceeded",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Errors produced while decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Blank line or JSON `null`.
    #[error("empty frame")]
    Nil,

    /// Not a valid message.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrameError::Nil => ErrorKind::NilMessage,
            FrameError::Malformed(_) => ErrorKind::BadMessage,
        }
    }
}

/// Decode one JSON Lines frame.
pub fn decode_frame(line: &str) -> Result<Message, FrameError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(FrameError::Nil);
    }
    match serde_json::from_str::<Option<Message>>(trimmed) {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(FrameError::Nil),
        Err(e) => Err(FrameError::Malformed(e.to_string())),
    }
}

/// Encode a message as one JSON Lines frame, including the trailing newline.
pub fn encode_frame(message: &Message) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

// ============================================================================
// Credentials
// ============================================================================

/// Password hash clients send with `register`, `generate` and `init_*`.
///
/// `BASE64(SHA256(name + password))`. For `generate` the name is empty.
pub fn credential_hash(name: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(password.as_bytes());
    STANDARD.encode(hasher.finalize())
}
