//! Room registry: the single owner of the room-id → room table.
//!
//! Rooms are created on first lookup and evicted once empty, clean and
//! without a flush in flight. A join that races an eviction sees
//! `RoomError::Closed`, forgets the closed room and retries against a fresh
//! one, which reloads the snapshot the closed room just flushed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::error::RoomError;
use crate::persistence::PersistenceBridge;
use crate::room::{ConnectionHandle, FlushReason, JoinOutcome, LeaveOutcome, Room};
use crate::room_id::RoomId;

const JOIN_ATTEMPTS: usize = 3;

/// Result of flushing every room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub written: usize,
    pub clean: usize,
    pub failed: usize,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    bridge: PersistenceBridge,
    config: RoomConfig,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl RoomRegistry {
    pub fn new(bridge: PersistenceBridge, config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            bridge,
            config,
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn bridge(&self) -> &PersistenceBridge {
        &self.bridge
    }

    /// Existing room or a new, not yet loaded one.
    pub async fn get_or_create(&self, id: &RoomId) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(id.clone(), self.config.clone(), self.bridge.clone()));
        rooms.insert(id.clone(), room.clone());
        self.created.fetch_add(1, Ordering::Relaxed);
        log::info!("Created room {id}");
        room
    }

    pub async fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Join `conn` to `id`, replacing a room closed by a concurrent eviction.
    pub async fn join(
        &self,
        id: &RoomId,
        conn: ConnectionHandle,
    ) -> Result<(Arc<Room>, JoinOutcome), RoomError> {
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.get_or_create(id).await;
            match room.join(conn.clone()).await {
                Ok(outcome) => return Ok((room, outcome)),
                Err(RoomError::Closed(_)) => {
                    log::debug!("Room {id} closed during join, retrying");
                    self.forget(id, &room).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(RoomError::Closed(id.to_string()))
    }

    /// Leave `id`, then evict the room if nobody is left.
    pub async fn leave(&self, id: &RoomId, conn_id: &str) -> Result<LeaveOutcome, RoomError> {
        let Some(room) = self.get(id).await else {
            return Ok(LeaveOutcome { removed: false, remaining: 0, flushed: false });
        };
        let outcome = room.leave(conn_id).await?;
        if outcome.remaining == 0 {
            self.evict_if_empty(id).await;
        }
        Ok(outcome)
    }

    /// Remove the room if it has no connections and nothing left to flush.
    /// Idempotent.
    pub async fn evict_if_empty(&self, id: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(id) else {
            return false;
        };
        if !room.try_close() {
            return false;
        }
        rooms.remove(id);
        self.evicted.fetch_add(1, Ordering::Relaxed);
        log::info!("Evicted room {id}");
        true
    }

    async fn forget(&self, id: &RoomId, closed: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(id).is_some_and(|r| Arc::ptr_eq(r, closed)) {
            rooms.remove(id);
        }
    }

    /// Evict rooms that have been empty for at least `idle_eviction`,
    /// flushing any that still hold unsaved changes first.
    pub async fn sweep_idle(&self) -> usize {
        let idle_after = self.config.idle_eviction();
        let mut evicted = 0;
        for (id, room) in self.snapshot().await {
            match room.empty_for().await {
                Some(idle) if idle >= idle_after => {}
                _ => continue,
            }
            if room.is_dirty().await {
                if let Err(e) = room.flush(FlushReason::Sweep).await {
                    log::warn!("Idle room {id} still unsaved: {e}");
                    continue;
                }
            }
            if self.evict_if_empty(&id).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            log::debug!("Idle sweep evicted {evicted} rooms");
        }
        evicted
    }

    /// Flush every dirty room. Used on shutdown.
    pub async fn flush_all(&self) -> FlushSummary {
        let mut summary = FlushSummary::default();
        for (id, room) in self.snapshot().await {
            match room.flush(FlushReason::Shutdown).await {
                Ok(Some(_)) => summary.written += 1,
                Ok(None) => summary.clean += 1,
                Err(e) => {
                    log::error!("Shutdown flush of {id} failed: {e}");
                    summary.failed += 1;
                }
            }
        }
        log::info!(
            "Flushed rooms: {} written, {} clean, {} failed",
            summary.written,
            summary.clean,
            summary.failed
        );
        summary
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.sweep_idle().await;
            }
        })
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn rooms_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn rooms_evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    async fn snapshot(&self) -> Vec<(RoomId, Arc<Room>)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Document;
    use crate::storage::{FileStorage, MemoryStorage};
    use std::sync::Arc;

    fn registry(config: RoomConfig) -> (Arc<MemoryStorage>, RoomRegistry) {
        let storage = Arc::new(MemoryStorage::new());
        let bridge = PersistenceBridge::new(storage.clone());
        (storage, RoomRegistry::new(bridge, config))
    }

    fn quiet_config() -> RoomConfig {
        RoomConfig {
            flush_debounce_ms: 60_000,
            flush_max_wait_ms: 60_000,
            ..RoomConfig::default()
        }
    }

    fn edit(text: &str) -> Vec<u8> {
        let doc = Document::new();
        doc.insert(0, text);
        doc.encode_state()
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let (storage, registry) = registry(quiet_config());
        let id = RoomId::new("s1", "main.py");

        let a = registry.get_or_create(&id).await;
        let b = registry.get_or_create(&id).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
        // Construction alone never reads storage.
        assert_eq!(registry.bridge().stats().loads, 0);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_single_room() {
        let (_storage, registry) = registry(quiet_config());
        let registry = Arc::new(registry);
        let id = RoomId::new("s1", "race.rs");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { registry.get_or_create(&id).await }));
        }
        let mut rooms = Vec::new();
        for h in handles {
            rooms.push(h.await.unwrap());
        }
        assert!(rooms.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.rooms_created(), 1);
    }

    #[tokio::test]
    async fn test_evict_if_empty_is_idempotent() {
        let (_storage, registry) = registry(quiet_config());
        let id = RoomId::new("s1", "a.rs");
        registry.get_or_create(&id).await;

        assert!(registry.evict_if_empty(&id).await);
        assert!(!registry.evict_if_empty(&id).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_occupied_room_not_evicted() {
        let (_storage, registry) = registry(quiet_config());
        let id = RoomId::new("s1", "a.rs");
        let (conn, _rx) = ConnectionHandle::channel("A", "a", 16);
        registry.join(&id, conn).await.unwrap();

        assert!(!registry.evict_if_empty(&id).await);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_last_leave_flushes_evicts_and_rejoin_reloads() {
        let (storage, registry) = registry(quiet_config());
        let id = RoomId::new("s1", "x.js");
        let (a, _rx) = ConnectionHandle::channel("A", "a", 16);
        let (room, _) = registry.join(&id, a).await.unwrap();
        room.apply_update("A", &edit("let x = 1;")).await.unwrap();

        let outcome = registry.leave(&id, "A").await.unwrap();
        assert!(outcome.flushed);
        assert_eq!(registry.bridge().stats().flushes, 1);
        assert_eq!(registry.room_count().await, 0);
        assert!(room.is_closed().await);

        let (b, _rx_b) = ConnectionHandle::channel("B", "b", 16);
        let (fresh, joined) = registry.join(&id, b).await.unwrap();
        assert!(!Arc::ptr_eq(&room, &fresh));
        let content = Document::from_snapshot(&joined.content.unwrap()).unwrap();
        assert_eq!(content.content(), "let x = 1;");
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_join_replaces_closed_room() {
        let (_storage, registry) = registry(quiet_config());
        let id = RoomId::new("s1", "a.rs");
        let stale = registry.get_or_create(&id).await;
        assert!(stale.try_close());

        let (conn, _rx) = ConnectionHandle::channel("A", "a", 16);
        let (room, _) = registry.join(&id, conn).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &room));
        assert_eq!(room.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_unknown_room_is_noop() {
        let (_storage, registry) = registry(quiet_config());
        let outcome = registry.leave(&RoomId::new("s1", "none"), "A").await.unwrap();
        assert!(!outcome.removed);
    }

    #[tokio::test]
    async fn test_sweep_idle_evicts_only_idle_rooms() {
        let (_storage, registry) = registry(RoomConfig {
            idle_eviction_secs: 0,
            ..quiet_config()
        });
        let idle = RoomId::new("s1", "idle.rs");
        let busy = RoomId::new("s1", "busy.rs");
        registry.get_or_create(&idle).await;
        let (conn, _rx) = ConnectionHandle::channel("A", "a", 16);
        registry.join(&busy, conn).await.unwrap();

        assert_eq!(registry.sweep_idle().await, 1);
        assert_eq!(registry.active_rooms().await, vec![busy]);
        assert_eq!(registry.rooms_evicted(), 1);
    }

    #[tokio::test]
    async fn test_flush_all_writes_dirty_rooms() {
        let (storage, registry) = registry(quiet_config());
        for (i, name) in ["a.rs", "b.rs", "c.rs"].iter().enumerate() {
            let id = RoomId::new("s1", *name);
            let (conn, _rx) = ConnectionHandle::channel(format!("c{i}"), "u", 16);
            let (room, _) = registry.join(&id, conn).await.unwrap();
            if i < 2 {
                room.apply_update(&format!("c{i}"), &edit(name)).await.unwrap();
            }
        }

        let summary = registry.flush_all().await;
        assert_eq!(summary, FlushSummary { written: 2, clean: 1, failed: 0 });
        assert_eq!(storage.list_files("s1").unwrap().len(), 2);
    }
}
