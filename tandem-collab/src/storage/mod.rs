//! Storage adapters behind the Account/Project store interface.
//!
//! ```text
//! ┌──────────────────┐  get_file / update_file   ┌─────────────────────┐
//! │ RoomManager      │ ────────────────────────► │ dyn FileStore       │
//! │ Persistence      │  append / prune           │  ├─ MemoryStore     │
//! │ Coordinator      │  latest_snapshot          │  └─ RocksStore      │
//! └──────────────────┘                           └─────────────────────┘
//! ```
//!
//! The `content` of a file is authoritative between sessions. Snapshots are
//! a recovery log of sealed [`SnapshotRecord`]s that lets a room resume with
//! its operation history instead of restarting from plain text. The log is
//! appended to on flush and pruned from the oldest end.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod memory;
pub mod rocks;
pub mod snapshot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};
pub use snapshot::{SnapshotError, SnapshotRecord};

/// A file as seen by the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub content: String,
    pub language: Option<String>,
}

impl FileRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            language: None,
        }
    }
}

/// One entry of a file's snapshot log, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub sequence: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Account/Project store as consumed by the sync engine.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn get_file(&self, file_id: &str) -> Result<FileRecord, StoreError>;

    /// Replace a file's content. The file must exist.
    async fn update_file(&self, file_id: &str, content: &str) -> Result<(), StoreError>;

    /// Append to the file's snapshot log. Returns the assigned sequence
    /// number (strictly increasing per file).
    async fn append_snapshot(&self, file_id: &str, data: Vec<u8>) -> Result<u64, StoreError>;

    /// The file's snapshot log in sequence order.
    async fn snapshots(&self, file_id: &str) -> Result<Vec<StoredSnapshot>, StoreError>;

    async fn latest_snapshot(&self, file_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        Ok(self.snapshots(file_id).await?.pop())
    }

    /// Drop all but the newest `keep` records of the file's snapshot log.
    /// Returns how many were removed.
    async fn prune_snapshots(&self, file_id: &str, keep: usize) -> Result<u64, StoreError>;
}
