//! Debounced write-through of room text to the file store.
//!
//! ```text
//! edit ─► on_document_changed ─► abort old timer, spawn new one
//!                                        │ (quiet for `debounce`)
//!                                        ▼
//!                                  spawn flush ─► update_file(text)
//!                                                 append_snapshot (optional)
//! ```
//!
//! At most one timer is armed per room. The timer only sleeps; the flush it
//! triggers runs as its own task, so re-arming never interrupts a write in
//! progress. Flushes of one room are serialized by the room's flush lock
//! and skipped when nothing changed since the last successful one.
//!
//! After each appended snapshot the log is pruned to the newest
//! [`SNAPSHOT_RETENTION`] records, so a corrupt latest record still has a
//! recent fallback and the log does not grow with the number of flushes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::room::Room;
use crate::server::ServerCounters;
use crate::storage::FileStore;

/// Snapshot records kept per file after a flush.
pub const SNAPSHOT_RETENTION: usize = 3;

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing changed since the last successful flush.
    Clean,
    /// Content written (snapshot written too if enabled and it succeeded).
    Written { version: u64 },
    /// The content write failed; the room stays dirty.
    Failed,
}

#[derive(Clone)]
pub struct PersistenceCoordinator {
    store: Arc<dyn FileStore>,
    debounce: Duration,
    snapshots: bool,
    retention: usize,
    counters: Arc<ServerCounters>,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<dyn FileStore>,
        debounce: Duration,
        snapshots: bool,
        counters: Arc<ServerCounters>,
    ) -> Self {
        Self {
            store,
            debounce,
            snapshots,
            retention: SNAPSHOT_RETENTION,
            counters,
        }
    }

    /// Keep the newest `keep` snapshot records per file (at least one).
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.retention = keep.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// (Re)arm the room's flush timer.
    pub fn on_document_changed(&self, room: &Arc<Room>) {
        let mut timer = room.lock_flush_timer();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        if room.is_closed() {
            return;
        }
        let coordinator = self.clone();
        let room = Arc::clone(room);
        let debounce = self.debounce;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            tokio::spawn(async move {
                coordinator.flush(&room).await;
            });
        }));
    }

    /// Disarm the room's flush timer, if any.
    pub fn cancel(&self, room: &Room) {
        if let Some(timer) = room.lock_flush_timer().take() {
            timer.abort();
        }
    }

    /// Write the room's current text through to the store. A failed write
    /// is logged and re-armed for the next debounce cycle.
    pub async fn flush(&self, room: &Arc<Room>) -> FlushOutcome {
        let outcome = self.flush_once(room).await;
        if outcome == FlushOutcome::Failed && !room.is_closed() {
            self.on_document_changed(room);
        }
        outcome
    }

    /// Like [`flush`](Self::flush) but never re-arms. Used on teardown.
    pub async fn flush_once(&self, room: &Room) -> FlushOutcome {
        let _serial = room.flush_lock().lock().await;

        let Some(capture) = room.capture_for_flush(self.snapshots).await else {
            return FlushOutcome::Clean;
        };

        if let Err(e) = self.store.update_file(room.file_id(), &capture.text).await {
            log::warn!("flush of room {} failed: {e}", room.key());
            self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
            return FlushOutcome::Failed;
        }
        room.mark_flushed(capture.version).await;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "flushed room {} at version {} ({} chars)",
            room.key(),
            capture.version,
            capture.text.chars().count()
        );

        if let Some(record) = capture.snapshot {
            let sealed = record.and_then(|r| r.seal());
            match sealed {
                Ok(bytes) => match self.store.append_snapshot(room.file_id(), bytes).await {
                    Ok(sequence) => {
                        self.counters.snapshots_written.fetch_add(1, Ordering::Relaxed);
                        log::trace!("room {} snapshot {sequence}", room.key());
                        match self.store.prune_snapshots(room.file_id(), self.retention).await {
                            Ok(0) => {}
                            Ok(pruned) => log::trace!("room {}: pruned {pruned} old snapshots", room.key()),
                            Err(e) => log::warn!("snapshot pruning for room {} failed: {e}", room.key()),
                        }
                    }
                    Err(e) => log::warn!("snapshot append for room {} failed: {e}", room.key()),
                },
                Err(e) => log::warn!("snapshot capture for room {} failed: {e}", room.key()),
            }
        }

        FlushOutcome::Written {
            version: capture.version,
        }
    }
}
