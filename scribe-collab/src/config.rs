//! Server, room and client configuration.
//!
//! Server settings load from `SCRIBE_*` environment variables and room
//! settings from `SCRIBE_ROOM_*`; anything unset keeps its default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::BackoffPolicy;
use crate::error::ConfigError;

/// Sync server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it is considered too slow
    pub outbound_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Idle-room sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// RocksDB directory (None = in-memory storage)
    pub storage_path: Option<PathBuf>,
    #[serde(skip)]
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4455".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 15,
            sweep_interval_secs: 10,
            storage_path: None,
            room: RoomConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config: ServerConfig = envy::prefixed("SCRIBE_").from_env()?;
        config.room = RoomConfig::from_env()?;
        log::debug!("Loaded configuration: {config:?}");
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Per-room limits and persistence timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub max_peers: usize,
    /// Quiet period after the last update before a flush
    pub flush_debounce_ms: u64,
    /// Upper bound on how long a dirty room waits for a flush
    pub flush_max_wait_ms: u64,
    /// Empty rooms older than this are evicted by the sweeper
    pub idle_eviction_secs: u64,
    /// Full presence resyncs allowed per window
    pub presence_resync_limit: usize,
    pub presence_resync_window_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_peers: 100,
            flush_debounce_ms: 2_000,
            flush_max_wait_ms: 10_000,
            idle_eviction_secs: 60,
            presence_resync_limit: 5,
            presence_resync_window_ms: 10_000,
        }
    }
}

impl RoomConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(envy::prefixed("SCRIBE_ROOM_").from_env()?)
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn flush_max_wait(&self) -> Duration {
        Duration::from_millis(self.flush_max_wait_ms.max(self.flush_debounce_ms))
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn presence_resync_window(&self) -> Duration {
        Duration::from_millis(self.presence_resync_window_ms)
    }
}

/// Client sync wrapper configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub server_url: String,
    /// Wire room name, `{sessionId}-{filePath}`
    pub room: String,
    /// Sent in the handshake for access checks
    pub user: String,
    pub display_name: String,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Local updates kept while not synced
    pub offline_queue_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>, user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            server_url: server_url.into(),
            room: room.into(),
            display_name: user.clone(),
            user,
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            offline_queue_capacity: 10_000,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}
