//! # scribe-collab: Real-time collaboration core for Scribe
//!
//! Keeps every open file's CRDT document consistent across the clients
//! editing it, relays cursor presence, and reconciles the live state with
//! durable file storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (per file)  │    Binary Proto    │ (central)   │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐
//! │ Document    │                    │RoomRegistry │
//! │ (local)     │                    │  └─ Room    │── PersistenceBridge ── FileStorage
//! └─────────────┘                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded [`WireMessage`])
//! - [`crdt`]: Yrs document wrapper
//! - [`presence`]: Presence entries and diffs
//! - [`room`] / [`registry`]: Server-side rooms and their lifecycle
//! - [`persistence`] / [`storage`]: Snapshot load/flush over file storage
//! - [`server`]: WebSocket sync server
//! - [`client`]: Sync client with reconnect backoff and offline queue

pub mod access;
pub mod client;
pub mod config;
pub mod crdt;
pub mod error;
pub mod events;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod room_id;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use access::{AccessControl, AccessLevel, AllowAll, StaticAccessList};
pub use client::{
    BackoffPolicy, ClientEvent, ClientStatus, ConnectionStatus, Lifecycle, OfflineQueue,
    Recovery, SyncClient,
};
pub use config::{ClientConfig, RoomConfig, ServerConfig};
pub use crdt::Document;
pub use error::{
    ConfigError, CrdtError, PersistenceError, PresenceError, ProtocolError, RoomError,
    ServerError, StorageError, TransportError,
};
pub use events::{EventBus, Subscription};
pub use persistence::{PersistenceBridge, PersistenceStats, Snapshot};
pub use presence::{
    CursorColor, CursorPosition, PresenceDiff, PresenceEntry, PresenceEvent, PresenceSet,
    SelectionRange,
};
pub use protocol::{ErrorKind, MessageType, WireMessage};
pub use registry::RoomRegistry;
pub use room::{ConnectionHandle, Room, RoomStats};
pub use room_id::RoomId;
pub use server::{ServerStats, SyncServer};
pub use storage::{FileMetadata, FileSnapshot, FileStorage, MemoryStorage, RocksConfig, RocksStorage};
