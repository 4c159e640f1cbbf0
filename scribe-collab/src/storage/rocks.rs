//! RocksDB-backed file storage.
//!
//! Column families:
//! - `files`: file bodies, LZ4 compressed (size-prepended)
//! - `metadata`: bincode [`FileMetadata`] with checksum of the body
//!
//! Keys are `session_id \0 file_path`, so one session's files are a
//! contiguous key range and can be listed with a prefix scan. Body and
//! metadata are written in a single batch.

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{checksum, FileMetadata, FileSnapshot, FileStorage};
use crate::error::StorageError;

const CF_FILES: &str = "files";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_FILES, CF_METADATA];

const KEY_SEPARATOR: u8 = 0;

/// RocksDB tuning.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable [`FileStorage`] on RocksDB.
pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksStorage {
    /// Open (creating if needed) the database at `config.path`.
    pub fn open(config: RocksConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened file storage at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            CF_FILES => {
                // Bodies are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Backend(format!("column family '{name}' not found")))
    }

    fn key(session_id: &str, path: &str) -> Vec<u8> {
        let mut key = Self::session_prefix(session_id);
        key.extend_from_slice(path.as_bytes());
        key
    }

    fn session_prefix(session_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(session_id.len() + 1);
        prefix.extend_from_slice(session_id.as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn decode_metadata(key: &str, bytes: &[u8]) -> Result<FileMetadata, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("metadata: {e}"),
            })?;
        Ok(meta)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl FileStorage for RocksStorage {
    fn get_file(&self, session_id: &str, path: &str) -> Result<Option<FileSnapshot>, StorageError> {
        let cf_files = self.cf(CF_FILES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = Self::key(session_id, path);
        let label = format!("{session_id}/{path}");

        let Some(compressed) = self.db.get_cf(&cf_files, &key)? else {
            return Ok(None);
        };
        let meta_bytes = self.db.get_cf(&cf_meta, &key)?.ok_or_else(|| StorageError::Corrupt {
            key: label.clone(),
            reason: "missing metadata".into(),
        })?;
        let metadata = Self::decode_metadata(&label, &meta_bytes)?;

        let bytes = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
            StorageError::Corrupt {
                key: label.clone(),
                reason: format!("decompress: {e}"),
            }
        })?;
        if checksum(&bytes) != metadata.checksum {
            return Err(StorageError::Corrupt {
                key: label,
                reason: "checksum mismatch".into(),
            });
        }

        Ok(Some(FileSnapshot { metadata, bytes }))
    }

    fn store_file(
        &self,
        session_id: &str,
        path: &str,
        bytes: &[u8],
        actor: &str,
    ) -> Result<FileMetadata, StorageError> {
        let cf_files = self.cf(CF_FILES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(bytes);
        let mut metadata = FileMetadata::new(session_id, path, bytes, actor);
        metadata.compressed_size = compressed.len() as u64;
        let encoded = bincode::serde::encode_to_vec(&metadata, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let key = Self::key(session_id, path);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_files, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &encoded);
        self.write(batch)?;

        log::trace!(
            "Stored {session_id}/{path}: {} bytes ({} compressed)",
            metadata.size,
            metadata.compressed_size
        );
        Ok(metadata)
    }

    fn list_files(&self, session_id: &str) -> Result<Vec<FileMetadata>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        let prefix = Self::session_prefix(session_id);

        let mut files = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let label = String::from_utf8_lossy(&key).replace('\0', "/");
            files.push(Self::decode_metadata(&label, &value)?);
        }
        Ok(files)
    }

    fn delete_file(&self, session_id: &str, path: &str) -> Result<bool, StorageError> {
        let cf_files = self.cf(CF_FILES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = Self::key(session_id, path);

        let existed = self.db.get_cf(&cf_meta, &key)?.is_some();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_files, &key);
        batch.delete_cf(&cf_meta, &key);
        self.write(batch)?;
        Ok(existed)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksStorage::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, storage) = open_temp();
        assert!(storage.path().exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let (_dir, storage) = open_temp();
        assert!(storage.get_file("s1", "nope.rs").unwrap().is_none());
    }

    #[test]
    fn test_store_and_load() {
        let (_dir, storage) = open_temp();
        let body = b"fn main() { println!(\"hello\"); }\n".repeat(50);

        let meta = storage.store_file("s1", "src/main.rs", &body, "ada").unwrap();
        assert_eq!(meta.size, body.len() as u64);
        assert!(meta.compressed_size < meta.size);

        let snap = storage.get_file("s1", "src/main.rs").unwrap().unwrap();
        assert_eq!(snap.bytes, body);
        assert_eq!(snap.metadata.updated_by, "ada");
    }

    #[test]
    fn test_empty_body_roundtrip() {
        let (_dir, storage) = open_temp();
        storage.store_file("s1", "empty.txt", b"", "ada").unwrap();
        let snap = storage.get_file("s1", "empty.txt").unwrap().unwrap();
        assert!(snap.bytes.is_empty());
    }

    #[test]
    fn test_overwrite_is_last_write_wins() {
        let (_dir, storage) = open_temp();
        storage.store_file("s1", "a.txt", b"first", "x").unwrap();
        storage.store_file("s1", "a.txt", b"second", "y").unwrap();

        let snap = storage.get_file("s1", "a.txt").unwrap().unwrap();
        assert_eq!(snap.bytes, b"second");
        assert_eq!(snap.metadata.updated_by, "y");
    }

    #[test]
    fn test_list_is_scoped_to_session() {
        let (_dir, storage) = open_temp();
        storage.store_file("s1", "b.rs", b"b", "x").unwrap();
        storage.store_file("s1", "a.rs", b"a", "x").unwrap();
        storage.store_file("s10", "c.rs", b"c", "x").unwrap();

        let paths: Vec<String> = storage
            .list_files("s1")
            .unwrap()
            .into_iter()
            .map(|m| m.file_path)
            .collect();
        assert_eq!(paths, vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn test_delete() {
        let (_dir, storage) = open_temp();
        storage.store_file("s1", "a.rs", b"a", "x").unwrap();
        assert!(storage.delete_file("s1", "a.rs").unwrap());
        assert!(!storage.delete_file("s1", "a.rs").unwrap());
        assert!(storage.get_file("s1", "a.rs").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_body_detected() {
        let (_dir, storage) = open_temp();
        storage.store_file("s1", "a.rs", b"original body", "x").unwrap();

        let cf = storage.cf(CF_FILES).unwrap();
        let tampered = lz4_flex::compress_prepend_size(b"tampered body");
        storage.db.put_cf(&cf, RocksStorage::key("s1", "a.rs"), tampered).unwrap();

        let err = storage.get_file("s1", "a.rs").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let storage = RocksStorage::open(RocksConfig::for_testing(&path)).unwrap();
            storage.store_file("s1", "keep.rs", b"durable", "x").unwrap();
            storage.sync().unwrap();
        }
        let storage = RocksStorage::open(RocksConfig::for_testing(&path)).unwrap();
        let snap = storage.get_file("s1", "keep.rs").unwrap().unwrap();
        assert_eq!(snap.bytes, b"durable");
    }
}
