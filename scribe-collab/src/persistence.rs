//! Persistence bridge between live room documents and file storage.
//!
//! Storage calls run on tokio's blocking pool so a slow disk never stalls
//! the tasks that relay updates. Flushes for the same file are serialized
//! by a per-file lock; different files flush concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::PersistenceError;
use crate::room_id::RoomId;
use crate::storage::{FileMetadata, FileSnapshot, FileStorage, MemoryStorage};

/// Result of a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    /// Nothing has ever been stored for this file.
    Empty,
    Stored(FileSnapshot),
}

impl Snapshot {
    /// Snapshot bytes; empty for [`Snapshot::Empty`].
    pub fn bytes(&self) -> &[u8] {
        match self {
            Snapshot::Empty => &[],
            Snapshot::Stored(snap) => &snap.bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Snapshot::Empty)
    }
}

/// Bridge counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub loads: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub bytes_written: u64,
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    bytes_written: AtomicU64,
}

/// Async facade over a [`FileStorage`] backend.
#[derive(Clone)]
pub struct PersistenceBridge {
    storage: Arc<dyn FileStorage>,
    file_locks: Arc<parking_lot::Mutex<HashMap<RoomId, Arc<tokio::sync::Mutex<()>>>>>,
    counters: Arc<Counters>,
}

impl PersistenceBridge {
    pub fn new(storage: Arc<dyn FileStorage>) -> Self {
        Self {
            storage,
            file_locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn storage(&self) -> &Arc<dyn FileStorage> {
        &self.storage
    }

    /// Last durable snapshot of `room`, or [`Snapshot::Empty`].
    pub async fn load(&self, room: &RoomId) -> Result<Snapshot, PersistenceError> {
        let storage = self.storage.clone();
        let session = room.session_id().to_string();
        let path = room.file_path().to_string();

        let loaded = tokio::task::spawn_blocking(move || storage.get_file(&session, &path))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))??;

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        Ok(match loaded {
            Some(snap) => {
                log::debug!("Loaded {room} ({} bytes)", snap.bytes.len());
                Snapshot::Stored(snap)
            }
            None => Snapshot::Empty,
        })
    }

    /// Write `bytes` as the durable state of `room`. Last write wins.
    pub async fn flush(
        &self,
        room: &RoomId,
        bytes: Vec<u8>,
        actor: &str,
    ) -> Result<FileMetadata, PersistenceError> {
        let lock = self
            .file_locks
            .lock()
            .entry(room.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            let storage = self.storage.clone();
            let session = room.session_id().to_string();
            let path = room.file_path().to_string();
            let actor = actor.to_string();
            let len = bytes.len() as u64;

            tokio::task::spawn_blocking(move || storage.store_file(&session, &path, &bytes, &actor))
                .await
                .map_err(|e| PersistenceError::Task(e.to_string()))
                .and_then(|r| r.map_err(PersistenceError::from))
                .map(|meta| (meta, len))
        };
        self.release_lock(room, lock);

        match result {
            Ok((meta, len)) => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_written.fetch_add(len, Ordering::Relaxed);
                log::debug!("Flushed {room}: {len} bytes by {}", meta.updated_by);
                Ok(meta)
            }
            Err(e) => {
                self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Flush of {room} failed: {e}");
                Err(e)
            }
        }
    }

    /// Drop the per-file lock once no other flush holds or awaits it.
    fn release_lock(&self, room: &RoomId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.file_locks.lock();
        drop(lock);
        if locks.get(room).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(room);
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            loads: self.counters.loads.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
        }
    }
}
