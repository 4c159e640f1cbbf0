//! Durable file storage behind the persistence bridge.
//!
//! ```text
//! ┌──────────────────┐  spawn_blocking  ┌───────────────────────────────┐
//! │ PersistenceBridge│ ───────────────► │ dyn FileStorage               │
//! │ (async)          │                  │  ├─ MemoryStorage (tests/dev) │
//! └──────────────────┘                  │  └─ RocksStorage  (RocksDB)   │
//!                                       └───────────────────────────────┘
//! ```
//!
//! Backends are synchronous. A file that was never stored is `Ok(None)`,
//! which keeps "empty document" apart from a failed or corrupt read.

pub mod rocks;

use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub use rocks::{RocksConfig, RocksStorage};

/// Record stored alongside every file body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub session_id: String,
    pub file_path: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Size on disk; equals `size` for uncompressed backends.
    pub compressed_size: u64,
    /// FNV-1a over the uncompressed bytes.
    pub checksum: u32,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
    pub updated_by: String,
}

impl FileMetadata {
    pub fn new(session_id: &str, file_path: &str, bytes: &[u8], actor: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            file_path: file_path.to_string(),
            size: bytes.len() as u64,
            compressed_size: bytes.len() as u64,
            checksum: checksum(bytes),
            updated_at: now_millis(),
            updated_by: actor.to_string(),
        }
    }
}

/// A stored file: body plus metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub metadata: FileMetadata,
    pub bytes: Vec<u8>,
}

/// File storage collaborator.
///
/// `store_file` overwrites (last write wins). Implementations must be safe
/// to call concurrently for different files.
pub trait FileStorage: Send + Sync + 'static {
    fn get_file(&self, session_id: &str, path: &str) -> Result<Option<FileSnapshot>, StorageError>;

    fn store_file(
        &self,
        session_id: &str,
        path: &str,
        bytes: &[u8],
        actor: &str,
    ) -> Result<FileMetadata, StorageError>;

    /// Metadata for every file of a session, ordered by path.
    fn list_files(&self, session_id: &str) -> Result<Vec<FileMetadata>, StorageError>;

    /// Returns whether the file existed.
    fn delete_file(&self, session_id: &str, path: &str) -> Result<bool, StorageError>;
}

/// FNV-1a checksum used to detect corrupt records.
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ─── In-memory backend ───────────────────────────────────────────────

/// Process-local storage. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<(String, String), FileSnapshot>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl FileStorage for MemoryStorage {
    fn get_file(&self, session_id: &str, path: &str) -> Result<Option<FileSnapshot>, StorageError> {
        let key = (session_id.to_string(), path.to_string());
        Ok(self.files.read().get(&key).cloned())
    }

    fn store_file(
        &self,
        session_id: &str,
        path: &str,
        bytes: &[u8],
        actor: &str,
    ) -> Result<FileMetadata, StorageError> {
        let metadata = FileMetadata::new(session_id, path, bytes, actor);
        let snapshot = FileSnapshot {
            metadata: metadata.clone(),
            bytes: bytes.to_vec(),
        };
        self.files
            .write()
            .insert((session_id.to_string(), path.to_string()), snapshot);
        Ok(metadata)
    }

    fn list_files(&self, session_id: &str) -> Result<Vec<FileMetadata>, StorageError> {
        let mut files: Vec<FileMetadata> = self
            .files
            .read()
            .iter()
            .filter(|((session, _), _)| session == session_id)
            .map(|(_, snap)| snap.metadata.clone())
            .collect();
        files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(files)
    }

    fn delete_file(&self, session_id: &str, path: &str) -> Result<bool, StorageError> {
        let key = (session_id.to_string(), path.to_string());
        Ok(self.files.write().remove(&key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_detects_change() {
        assert_eq!(checksum(b""), 0x811c_9dc5);
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
    }

    #[test]
    fn test_missing_file_is_none() {
        let storage = MemoryStorage::new();
        assert!(storage.get_file("s1", "main.py").unwrap().is_none());
    }

    #[test]
    fn test_store_then_get() {
        let storage = MemoryStorage::new();
        let meta = storage.store_file("s1", "main.py", b"print(1)", "ada@example.com").unwrap();
        assert_eq!(meta.size, 8);
        assert_eq!(meta.updated_by, "ada@example.com");

        let snap = storage.get_file("s1", "main.py").unwrap().unwrap();
        assert_eq!(snap.bytes, b"print(1)");
        assert_eq!(snap.metadata.checksum, checksum(b"print(1)"));
    }

    #[test]
    fn test_last_write_wins() {
        let storage = MemoryStorage::new();
        storage.store_file("s1", "a.rs", b"one", "x").unwrap();
        storage.store_file("s1", "a.rs", b"two", "y").unwrap();

        let snap = storage.get_file("s1", "a.rs").unwrap().unwrap();
        assert_eq!(snap.bytes, b"two");
        assert_eq!(snap.metadata.updated_by, "y");
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_list_and_delete() {
        let storage = MemoryStorage::new();
        storage.store_file("s1", "b.rs", b"b", "x").unwrap();
        storage.store_file("s1", "a.rs", b"a", "x").unwrap();
        storage.store_file("s2", "c.rs", b"c", "x").unwrap();

        let paths: Vec<String> = storage
            .list_files("s1")
            .unwrap()
            .into_iter()
            .map(|m| m.file_path)
            .collect();
        assert_eq!(paths, vec!["a.rs", "b.rs"]);

        assert!(storage.delete_file("s1", "a.rs").unwrap());
        assert!(!storage.delete_file("s1", "a.rs").unwrap());
        assert_eq!(storage.list_files("s1").unwrap().len(), 1);
    }
}
