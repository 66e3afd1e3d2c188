//! RocksDB-backed file store.
//!
//! Column families:
//! - `files`: file records (bincode `{content, language}`), keyed by file id
//! - `snapshots`: sealed snapshot records, keyed by `<len:u16 BE><file id><seq:u64 BE>`
//! - `metadata`: per-file bookkeeping (next snapshot sequence, timestamps)
//!
//! Snapshot records are already LZ4 compressed when they arrive, so the
//! `snapshots` family disables RocksDB's own compression.
//!
//! RocksDB calls block, so the [`FileStore`] methods hand them to
//! `spawn_blocking` instead of running them on a runtime worker.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction,
    IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::{FileRecord, FileStore, StoreError, StoredSnapshot};

const CF_FILES: &str = "files";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_FILES, CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Create an empty record for unknown files on first read (default: false)
    pub create_missing_files: bool,
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
            create_missing_files: false,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            create_missing_files: false,
        }
    }
}

/// Per-file bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub next_sequence: u64,
    /// Records currently in the snapshot log.
    pub snapshot_count: u64,
    /// Seconds since epoch of the last content update.
    pub updated_at: u64,
}

/// RocksDB store. Async [`FileStore`] calls run on tokio's blocking pool;
/// the inherent methods are synchronous.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: DB,
    config: StoreConfig,
    /// Serializes read-modify-write of metadata.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &config, &cache)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, descriptors)?;
        log::info!("opened file store at {}", config.path.display());
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Create or replace a file record.
    pub fn insert_file(&self, file_id: &str, record: &FileRecord) -> Result<(), StoreError> {
        self.inner.insert_file(file_id, record)
    }

    pub fn metadata(&self, file_id: &str) -> Result<FileMetadata, StoreError> {
        self.inner.metadata(file_id)
    }

    /// Drop snapshots with a sequence below `keep_from`. Returns how many
    /// were deleted.
    pub fn compact_snapshots(&self, file_id: &str, keep_from: u64) -> Result<u64, StoreError> {
        self.inner.compact_snapshots(file_id, keep_from)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.inner.config.path
    }

    async fn blocking<T, F>(&self, file_id: &str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let file_id = file_id.to_string();
        tokio::task::spawn_blocking(move || op(&inner, &file_id))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
    let mut opts = Options::default();
    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_block_cache(cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    block_opts.set_block_size(16 * 1024);
    opts.set_block_based_table_factory(&block_opts);
    opts.set_write_buffer_size(config.write_buffer_size);

    match name {
        CF_SNAPSHOTS => {
            opts.set_compression_type(DBCompressionType::None);
            opts.set_max_write_buffer_number(4);
        }
        _ => {
            opts.set_compression_type(DBCompressionType::Lz4);
            opts.set_max_write_buffer_number(2);
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
    }
    opts
}

impl Inner {
    fn insert_file(&self, file_id: &str, record: &FileRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_FILES)?;
        self.db
            .put_cf_opt(cf, file_id.as_bytes(), encode(record)?, &self.write_options())?;
        Ok(())
    }

    fn metadata(&self, file_id: &str) -> Result<FileMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, file_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(FileMetadata::default()),
        }
    }

    fn get_file(&self, file_id: &str) -> Result<FileRecord, StoreError> {
        let cf = self.cf(CF_FILES)?;
        if let Some(bytes) = self.db.get_cf(cf, file_id.as_bytes())? {
            return decode(&bytes);
        }
        if !self.config.create_missing_files {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        let _guard = self.lock_writes();
        if let Some(bytes) = self.db.get_cf(cf, file_id.as_bytes())? {
            return decode(&bytes);
        }
        let record = FileRecord::default();
        self.insert_file(file_id, &record)?;
        log::debug!("created empty file {file_id}");
        Ok(record)
    }

    fn update_file(&self, file_id: &str, content: &str) -> Result<(), StoreError> {
        let cf_files = self.cf(CF_FILES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let _guard = self.lock_writes();

        let mut record: FileRecord = match self.db.get_cf(cf_files, file_id.as_bytes())? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(StoreError::NotFound(file_id.to_string())),
        };
        record.content = content.to_string();
        let mut meta = self.metadata(file_id)?;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_files, file_id.as_bytes(), encode(&record)?);
        batch.put_cf(cf_meta, file_id.as_bytes(), encode(&meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn append_snapshot(&self, file_id: &str, data: &[u8]) -> Result<u64, StoreError> {
        let cf_files = self.cf(CF_FILES)?;
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let _guard = self.lock_writes();

        if self.db.get_cf(cf_files, file_id.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        let mut meta = self.metadata(file_id)?;
        let sequence = meta.next_sequence;
        meta.next_sequence += 1;
        meta.snapshot_count += 1;

        let mut key = snapshot_prefix(file_id)?;
        key.extend_from_slice(&sequence.to_be_bytes());

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snaps, &key, data);
        batch.put_cf(cf_meta, file_id.as_bytes(), encode(&meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        log::debug!("stored snapshot {sequence} for file {file_id} ({} bytes)", data.len());
        Ok(sequence)
    }

    fn snapshots(&self, file_id: &str) -> Result<Vec<StoredSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = snapshot_prefix(file_id)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            let Some(sequence) = snapshot_sequence(&prefix, &key) else {
                break;
            };
            out.push(StoredSnapshot {
                sequence,
                data: value.to_vec(),
            });
        }
        Ok(out)
    }

    /// Seeks backwards from the highest possible key of the file.
    fn latest_snapshot(&self, file_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = snapshot_prefix(file_id)?;
        let mut last = prefix.clone();
        last.extend_from_slice(&u64::MAX.to_be_bytes());
        let Some(item) = self
            .db
            .iterator_cf(cf, IteratorMode::From(&last, Direction::Reverse))
            .next()
        else {
            return Ok(None);
        };
        let (key, value) = item?;
        Ok(snapshot_sequence(&prefix, &key).map(|sequence| StoredSnapshot {
            sequence,
            data: value.to_vec(),
        }))
    }

    fn prune_snapshots(&self, file_id: &str, keep: usize) -> Result<u64, StoreError> {
        let count = self.metadata(file_id)?.snapshot_count as usize;
        if count <= keep {
            return Ok(0);
        }
        let sequences = self.snapshot_sequences(file_id)?;
        if sequences.len() <= keep {
            return Ok(0);
        }
        let keep_from = sequences[sequences.len() - keep];
        self.compact_snapshots(file_id, keep_from)
    }

    fn compact_snapshots(&self, file_id: &str, keep_from: u64) -> Result<u64, StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let _guard = self.lock_writes();

        let prefix = snapshot_prefix(file_id)?;
        let mut batch = WriteBatch::default();
        let mut count = 0;
        for sequence in self.snapshot_sequences(file_id)? {
            if sequence >= keep_from {
                break;
            }
            let mut key = prefix.clone();
            key.extend_from_slice(&sequence.to_be_bytes());
            batch.delete_cf(cf_snaps, key);
            count += 1;
        }
        if count == 0 {
            return Ok(0);
        }
        let mut meta = self.metadata(file_id)?;
        meta.snapshot_count = meta.snapshot_count.saturating_sub(count);
        batch.put_cf(cf_meta, file_id.as_bytes(), encode(&meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        log::debug!("compacted {count} snapshots of file {file_id}");
        Ok(count)
    }

    fn snapshot_sequences(&self, file_id: &str) -> Result<Vec<u64>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = snapshot_prefix(file_id)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = item?;
            match snapshot_sequence(&prefix, &key) {
                Some(sequence) => out.push(sequence),
                None => break,
            }
        }
        Ok(out)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FileStore for RocksStore {
    async fn get_file(&self, file_id: &str) -> Result<FileRecord, StoreError> {
        self.blocking(file_id, |inner, id| inner.get_file(id)).await
    }

    async fn update_file(&self, file_id: &str, content: &str) -> Result<(), StoreError> {
        let content = content.to_string();
        self.blocking(file_id, move |inner, id| inner.update_file(id, &content))
            .await
    }

    async fn append_snapshot(&self, file_id: &str, data: Vec<u8>) -> Result<u64, StoreError> {
        self.blocking(file_id, move |inner, id| inner.append_snapshot(id, &data))
            .await
    }

    async fn snapshots(&self, file_id: &str) -> Result<Vec<StoredSnapshot>, StoreError> {
        self.blocking(file_id, |inner, id| inner.snapshots(id)).await
    }

    async fn latest_snapshot(&self, file_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        self.blocking(file_id, |inner, id| inner.latest_snapshot(id)).await
    }

    async fn prune_snapshots(&self, file_id: &str, keep: usize) -> Result<u64, StoreError> {
        self.blocking(file_id, move |inner, id| inner.prune_snapshots(id, keep))
            .await
    }
}

/// Sequence number of `key` if it is a snapshot key of the file owning
/// `prefix`.
fn snapshot_sequence(prefix: &[u8], key: &[u8]) -> Option<u64> {
    if key.len() != prefix.len() + 8 || !key.starts_with(prefix) {
        return None;
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&key[prefix.len()..]);
    Some(u64::from_be_bytes(seq))
}

fn snapshot_prefix(file_id: &str) -> Result<Vec<u8>, StoreError> {
    let len = u16::try_from(file_id.len())
        .map_err(|_| StoreError::Serialization(format!("file id too long ({} bytes)", file_id.len())))?;
    let mut prefix = Vec::with_capacity(2 + file_id.len() + 8);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(file_id.as_bytes());
    Ok(prefix)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn now_secs() -> u64 {
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
