//! Error taxonomy for the collaboration core.
//!
//! Malformed payloads, transport failures, authorization failures and
//! persistence failures are kept apart so that each layer can decide
//! whether to drop, resync, retry or surface them.

use thiserror::Error;

/// Wire encoding failures.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid room id {0:?}")]
    InvalidRoomId(String),
}

/// CRDT update failures. Never fatal for a room.
#[derive(Debug, Clone, Error)]
pub enum CrdtError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    #[error("update rejected by document: {0}")]
    Rejected(String),

    #[error("document observer could not be registered: {0}")]
    Observer(String),
}

/// Presence diff failures.
#[derive(Debug, Clone, Error)]
pub enum PresenceError {
    #[error("malformed presence diff: {0}")]
    Malformed(String),

    #[error("presence encode failed: {0}")]
    Encode(String),
}

/// Durable file storage failures.
///
/// A missing file is not an error; backends return `Ok(None)` for it.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Persistence bridge failures, reported to whoever requested the flush.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("persistence task failed: {0}")]
    Task(String),
}

/// Room operation failures.
#[derive(Debug, Clone, Error)]
pub enum RoomError {
    /// The room was evicted; callers must look it up again.
    #[error("room {0} is closed")]
    Closed(String),

    #[error("connection {0} has not joined the room")]
    NotJoined(String),

    #[error("connection {0} has read-only access")]
    ReadOnly(String),

    #[error("room {room} is full ({limit} peers)")]
    Full { room: String, limit: usize },

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client transport failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("connection timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Io(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Fatal errors end the connection lifecycle without consuming retry budget.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::http::StatusCode;
        use tokio_tungstenite::tungstenite::Error;

        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => TransportError::Closed,
            Error::Http(response) => {
                let status = response.status();
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    TransportError::Unauthorized(format!("handshake rejected with {status}"))
                } else {
                    TransportError::Io(format!("handshake failed with {status}"))
                }
            }
            other => TransportError::Io(other.to_string()),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Server startup and accept-loop failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable error: {0}")]
    Env(#[from] envy::Error),
}
