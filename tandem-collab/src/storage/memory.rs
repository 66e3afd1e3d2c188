//! In-memory [`FileStore`], for tests and the storage-less server mode.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{FileRecord, FileStore, StoreError, StoredSnapshot};

#[derive(Debug, Default)]
struct StoredFile {
    record: FileRecord,
    snapshots: Vec<StoredSnapshot>,
    next_sequence: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<String, StoredFile>>,
    fail_writes: AtomicBool,
    updates: AtomicU64,
    create_missing: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve unknown files as empty ones instead of `NotFound`.
    pub fn create_missing(mut self, create: bool) -> Self {
        self.create_missing = create;
        self
    }

    /// Create or replace a file, clearing its snapshot log.
    pub async fn insert_file(&self, file_id: &str, record: FileRecord) {
        self.files.write().await.insert(
            file_id.to_string(),
            StoredFile {
                record,
                ..StoredFile::default()
            },
        );
    }

    pub async fn content(&self, file_id: &str) -> Option<String> {
        self.files
            .read()
            .await
            .get(file_id)
            .map(|f| f.record.content.clone())
    }

    /// While set, every write fails with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful `update_file` calls so far.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn get_file(&self, file_id: &str) -> Result<FileRecord, StoreError> {
        if let Some(file) = self.files.read().await.get(file_id) {
            return Ok(file.record.clone());
        }
        if !self.create_missing {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        let mut files = self.files.write().await;
        Ok(files.entry(file_id.to_string()).or_default().record.clone())
    }

    async fn update_file(&self, file_id: &str, content: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut files = self.files.write().await;
        let file = files
            .get_mut(file_id)
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))?;
        file.record.content = content.to_string();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_snapshot(&self, file_id: &str, data: Vec<u8>) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut files = self.files.write().await;
        let file = files
            .get_mut(file_id)
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))?;
        let sequence = file.next_sequence;
        file.next_sequence += 1;
        file.snapshots.push(StoredSnapshot { sequence, data });
        Ok(sequence)
    }

    async fn snapshots(&self, file_id: &str) -> Result<Vec<StoredSnapshot>, StoreError> {
        self.files
            .read()
            .await
            .get(file_id)
            .map(|f| f.snapshots.clone())
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))
    }

    async fn latest_snapshot(&self, file_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        self.files
            .read()
            .await
            .get(file_id)
            .map(|f| f.snapshots.last().cloned())
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))
    }

    async fn prune_snapshots(&self, file_id: &str, keep: usize) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut files = self.files.write().await;
        let file = files
            .get_mut(file_id)
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))?;
        let excess = file.snapshots.len().saturating_sub(keep);
        file.snapshots.drain(..excess);
        Ok(excess as u64)
    }
}
