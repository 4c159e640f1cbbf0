//! Binary wire protocol spoken between sync clients and the room server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`WireMessage`]:
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────┐
//! │ variant tag  │ fields (room, payload bytes, origin, ...)   │
//! │ varint       │ length-prefixed                             │
//! └──────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! CRDT updates and presence diffs travel as opaque byte payloads; the
//! protocol layer never looks inside them.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Handshake header carrying the connecting user's identity.
pub const USER_HEADER: &str = "x-scribe-user";

/// Message kinds, used for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Welcome,
    JoinRoom,
    LeaveRoom,
    RequestSync,
    SyncResponse,
    Update,
    AwarenessUpdate,
    SaveFile,
    SaveResult,
    Error,
    Ping,
    Pong,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Welcome => "welcome",
            MessageType::JoinRoom => "join-room",
            MessageType::LeaveRoom => "leave-room",
            MessageType::RequestSync => "request-sync",
            MessageType::SyncResponse => "sync-response",
            MessageType::Update => "update",
            MessageType::AwarenessUpdate => "awareness-update",
            MessageType::SaveFile => "save-file",
            MessageType::SaveResult => "save-result",
            MessageType::Error => "error",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Access check failed. Always fatal.
    Unauthorized,
    /// Update sent on a read-only connection.
    ReadOnly,
    /// Room reached its peer limit.
    RoomFull,
    /// Payload failed to decode.
    MalformedPayload,
    /// Message referenced a room the connection has not joined.
    NotJoined,
    Internal,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Server → client, first frame on every connection.
    Welcome { connection_id: String },

    JoinRoom { room: String },

    LeaveRoom { room: String },

    RequestSync { room: String },

    /// Full snapshot. `None` means the document is empty.
    SyncResponse { room: String, content: Option<Vec<u8>> },

    /// CRDT delta, relayed to every connection in the room except `origin`.
    Update { room: String, update: Vec<u8>, origin: String },

    /// Encoded presence diff, relayed like `Update`.
    AwarenessUpdate { room: String, update: Vec<u8>, origin: String },

    /// Explicit save request; answered with `SaveResult` to the requester only.
    SaveFile { room: String },

    SaveResult { room: String, ok: bool, error: Option<String> },

    Error {
        room: Option<String>,
        kind: ErrorKind,
        fatal: bool,
        message: String,
    },

    Ping,

    Pong,
}

impl WireMessage {
    pub fn update(room: impl Into<String>, update: Vec<u8>, origin: impl Into<String>) -> Self {
        WireMessage::Update {
            room: room.into(),
            update,
            origin: origin.into(),
        }
    }

    pub fn awareness(room: impl Into<String>, update: Vec<u8>, origin: impl Into<String>) -> Self {
        WireMessage::AwarenessUpdate {
            room: room.into(),
            update,
            origin: origin.into(),
        }
    }

    /// Build an error frame. Unauthorized errors are always fatal.
    pub fn error(room: Option<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        WireMessage::Error {
            room,
            kind,
            fatal: kind == ErrorKind::Unauthorized,
            message: message.into(),
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            WireMessage::Welcome { .. } => MessageType::Welcome,
            WireMessage::JoinRoom { .. } => MessageType::JoinRoom,
            WireMessage::LeaveRoom { .. } => MessageType::LeaveRoom,
            WireMessage::RequestSync { .. } => MessageType::RequestSync,
            WireMessage::SyncResponse { .. } => MessageType::SyncResponse,
            WireMessage::Update { .. } => MessageType::Update,
            WireMessage::AwarenessUpdate { .. } => MessageType::AwarenessUpdate,
            WireMessage::SaveFile { .. } => MessageType::SaveFile,
            WireMessage::SaveResult { .. } => MessageType::SaveResult,
            WireMessage::Error { .. } => MessageType::Error,
            WireMessage::Ping => MessageType::Ping,
            WireMessage::Pong => MessageType::Pong,
        }
    }

    /// Room the message addresses, if any.
    pub fn room(&self) -> Option<&str> {
        match self {
            WireMessage::JoinRoom { room }
            | WireMessage::LeaveRoom { room }
            | WireMessage::RequestSync { room }
            | WireMessage::SyncResponse { room, .. }
            | WireMessage::Update { room, .. }
            | WireMessage::AwarenessUpdate { room, .. }
            | WireMessage::SaveFile { room }
            | WireMessage::SaveResult { room, .. } => Some(room),
            WireMessage::Error { room, .. } => room.as_deref(),
            WireMessage::Welcome { .. } | WireMessage::Ping | WireMessage::Pong => None,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format. Trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Deserialization(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }
}
