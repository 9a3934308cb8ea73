//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: Full document state per session name (LZ4 compressed)
//! - `updates`: Incremental updates appended since the last full state
//!   (LZ4 compressed, keyed by name:sequence)
//! - `metadata`: Per-document bookkeeping (bincode)
//!
//! Update keys are `<name length:4 bytes BE><name bytes><sequence:8 bytes BE>`,
//! so one document's updates are contiguous and sorted by sequence.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use super::{DocumentStorage, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes, shared by all column families (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Store rooted at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
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

/// Bookkeeping stored alongside each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Session name
    pub name: String,
    /// Sequence number of the last write touching this document
    pub version: u64,
    /// Updates appended since the last full state
    pub update_count: u64,
    /// Uncompressed size of the last full state
    pub state_size: u64,
    /// Compressed size of the last full state
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_string(),
            version: 0,
            update_count: 0,
            state_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed `DocumentStorage`.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next sequence number handed out to a write
    sequence: AtomicU64,
    /// Serializes metadata read-modify-write cycles
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::debug!(
            "Opened document store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4 framed already.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small appends, range-scanned per document.
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Highest sequence recorded in any document's metadata, plus one.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let Some(cf) = db.cf_handle(CF_METADATA) else {
            return Ok(0);
        };
        let mut next = 0;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta = DocumentMetadata::decode(&value)?;
            next = next.max(meta.version + 1);
        }
        Ok(next)
    }

    /// Metadata for `name`, if the document exists.
    pub fn metadata(&self, name: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Names of all stored documents.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            names.push(name);
        }
        Ok(names)
    }

    /// Delete a document: full state, updates and metadata.
    pub fn delete_document(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, name.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, name.as_bytes());
        self.delete_updates(name, &mut batch)?;
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables of every column family to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    /// Next sequence number to be assigned.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn load_updates(&self, name: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(name);
        let mut updates = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            updates.push(decompress(&value)?);
        }
        Ok(updates)
    }

    fn delete_updates(&self, name: &str, batch: &mut WriteBatch) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(name);
        let mut count = 0;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }
        Ok(count)
    }
}

impl DocumentStorage for RocksStore {
    fn load(&self, name: &str) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let mut stored = Vec::new();
        if let Some(compressed) = self.db.get_cf(cf_docs, name.as_bytes())? {
            stored.push(decompress(&compressed)?);
        }
        stored.extend(self.load_updates(name)?);

        if stored.is_empty() {
            return Ok(None);
        }
        Ok(Some(stored))
    }

    fn append_update(&self, name: &str, update: &[u8]) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut meta = self
            .metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name));
        meta.version = seq;
        meta.update_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_UPDATES)?,
            update_key(name, seq),
            lz4_flex::compress_prepend_size(update),
        );
        batch.put_cf(self.cf(CF_METADATA)?, name.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(seq)
    }

    fn store_full_state(&self, name: &str, state: &[u8]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let compressed = lz4_flex::compress_prepend_size(state);

        let mut meta = self
            .metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name));
        meta.version = seq;
        meta.update_count = 0;
        meta.state_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        // Snapshot, metadata and compaction land atomically.
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, name.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, name.as_bytes(), meta.encode()?);
        let compacted = self.delete_updates(name, &mut batch)?;
        self.db.write_opt(batch, &self.write_options())?;

        log::trace!(
            "Stored full state for '{name}': {} -> {} bytes, {compacted} updates compacted",
            state.len(),
            compressed.len()
        );
        Ok(())
    }
}

fn update_prefix(name: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + name.len());
    prefix.extend_from_slice(&(name.len() as u32).to_be_bytes());
    prefix.extend_from_slice(name.as_bytes());
    prefix
}

fn update_key(name: &str, seq: u64) -> Vec<u8> {
    let mut key = update_prefix(name);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert_eq!(store.sequence(), 0);
    }

    #[test]
    fn test_load_missing_is_none() {
        let (_dir, store) = open_temp();
        assert!(store.load("absent").unwrap().is_none());
        assert!(store.metadata("absent").unwrap().is_none());
    }

    #[test]
    fn test_full_state_then_updates() {
        let (_dir, store) = open_temp();
        store.store_full_state("room", b"full state bytes").unwrap();
        store.append_update("room", b"update_1").unwrap();
        store.append_update("room", b"update_2").unwrap();

        let loaded = store.load("room").unwrap().unwrap();
        assert_eq!(
            loaded,
            vec![
                b"full state bytes".to_vec(),
                b"update_1".to_vec(),
                b"update_2".to_vec()
            ]
        );
    }

    #[test]
    fn test_updates_only() {
        let (_dir, store) = open_temp();
        for i in 0..10 {
            store
                .append_update("room", format!("update_{i}").as_bytes())
                .unwrap();
        }
        let loaded = store.load("room").unwrap().unwrap();
        assert_eq!(loaded.len(), 10);
        assert_eq!(loaded[0], b"update_0");
        assert_eq!(loaded[9], b"update_9");
    }

    #[test]
    fn test_full_state_compacts_updates() {
        let (_dir, store) = open_temp();
        for i in 0..5u8 {
            store.append_update("room", &[i; 32]).unwrap();
        }
        assert_eq!(store.metadata("room").unwrap().unwrap().update_count, 5);

        store.store_full_state("room", b"merged").unwrap();
        let meta = store.metadata("room").unwrap().unwrap();
        assert_eq!(meta.update_count, 0);
        assert_eq!(meta.state_size, 6);
        assert_eq!(store.load("room").unwrap().unwrap(), vec![b"merged".to_vec()]);
    }

    #[test]
    fn test_prefix_names_are_isolated() {
        let (_dir, store) = open_temp();
        store.append_update("doc", b"short").unwrap();
        store.append_update("doc-2", b"long").unwrap();
        store.store_full_state("doc", b"base").unwrap();

        assert_eq!(store.load("doc").unwrap().unwrap(), vec![b"base".to_vec()]);
        assert_eq!(store.load("doc-2").unwrap().unwrap(), vec![b"long".to_vec()]);
    }

    #[test]
    fn test_list_and_delete_documents() {
        let (_dir, store) = open_temp();
        for name in ["a", "b", "c"] {
            store.store_full_state(name, b"x").unwrap();
        }
        store.append_update("b", b"y").unwrap();

        let mut names = store.list_documents().unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);

        store.delete_document("b").unwrap();
        assert!(store.load("b").unwrap().is_none());
        assert!(store.metadata("b").unwrap().is_none());
        assert_eq!(store.list_documents().unwrap().len(), 2);
    }

    #[test]
    fn test_sequence_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path());

        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.append_update("room", b"a").unwrap();
            store.append_update("room", b"b").unwrap();
            store.append_update("other", b"c").unwrap();
            assert_eq!(store.sequence(), 3);
            store.sync().unwrap();
        }

        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.sequence(), 3);
        assert_eq!(store.append_update("room", b"d").unwrap(), 3);

        let loaded = store.load("room").unwrap().unwrap();
        assert_eq!(loaded, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_large_state_compresses() {
        let (_dir, store) = open_temp();
        let data = vec![42u8; 1_000_000];
        store.store_full_state("big", &data).unwrap();

        let meta = store.metadata("big").unwrap().unwrap();
        assert_eq!(meta.state_size, 1_000_000);
        assert!(meta.compressed_size < 100_000);

        let loaded = store.load("big").unwrap().unwrap();
        assert_eq!(loaded[0].len(), 1_000_000);
    }

    #[test]
    fn test_metadata_timestamps() {
        let (_dir, store) = open_temp();
        store.append_update("room", b"u").unwrap();
        let meta = store.metadata("room").unwrap().unwrap();
        assert_eq!(meta.name, "room");
        assert!(meta.created_at > 0);
        assert!(meta.updated_at >= meta.created_at);
    }
}
