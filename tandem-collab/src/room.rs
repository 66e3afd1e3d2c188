//! Rooms and their lifecycle.
//!
//! ```text
//!            RoomManager
//!  ┌───────────────────────────────┐
//!  │ slots: key ─► RoomSlot        │   join/leave for one key are
//!  │          (tokio Mutex)        │   linearized on its slot
//!  └──────────────┬────────────────┘
//!                 ▼
//!               Room ── state: Mutex<RoomState> ── Document
//!                 │                               AwarenessTable
//!                 │                               sessions
//!                 ├── BroadcastGroup (one bounded channel)
//!                 └── flush timer (PersistenceCoordinator)
//! ```
//!
//! Every mutation of a room's document or awareness table happens under its
//! state lock, and the resulting frames are broadcast before the lock is
//! released, so all sessions observe operations in integration order.
//! Rooms never share a lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use tandem_core::{ApplyStatus, ClientId, Document, ItemId, Operation, StateVector};

use crate::awareness::{AwarenessChange, AwarenessTable, AwarenessUpdate, SessionId};
use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame};
use crate::persistence::{FlushOutcome, PersistenceCoordinator};
use crate::protocol::{file_id_from_room_key, SyncMessage};
use crate::server::{ServerCounters, ServerError};
use crate::storage::snapshot::{recover_latest, SnapshotError, SnapshotRecord};
use crate::storage::{FileStore, StoredSnapshot};

/// Per-room limits.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_sessions: usize,
    pub queue_capacity: usize,
    pub max_pending: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            queue_capacity: 256,
            max_pending: tandem_core::DEFAULT_MAX_PENDING,
        }
    }
}

/// Summary of one Update/StateResponse applied to a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub integrated: usize,
    pub buffered: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// What a flush needs, captured under the state lock.
pub(crate) struct FlushCapture {
    pub version: u64,
    pub text: String,
    pub snapshot: Option<Result<SnapshotRecord, SnapshotError>>,
}

struct RoomState {
    doc: Document,
    awareness: AwarenessTable,
    sessions: HashSet<SessionId>,
    /// Session each buffered operation arrived from.
    pending_origins: HashMap<ItemId, SessionId>,
    /// Bumped on every integrated operation.
    version: u64,
    flushed_version: u64,
}

/// One live room: a document, its awareness table and its sessions.
pub struct Room {
    key: String,
    file_id: String,
    state: Mutex<RoomState>,
    broadcast: BroadcastGroup,
    persistence: PersistenceCoordinator,
    flush_timer: std::sync::Mutex<Option<JoinHandle<()>>>,
    flush_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Room {
    fn new(
        key: String,
        file_id: String,
        doc: Document,
        config: &RoomConfig,
        persistence: PersistenceCoordinator,
    ) -> Self {
        Self {
            key,
            file_id,
            state: Mutex::new(RoomState {
                doc,
                awareness: AwarenessTable::new(),
                sessions: HashSet::new(),
                pending_origins: HashMap::new(),
                version: 0,
                flushed_version: 0,
            }),
            broadcast: BroadcastGroup::new(config.queue_capacity),
            persistence,
            flush_timer: std::sync::Mutex::new(None),
            flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn broadcast_group(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    pub async fn text(&self) -> String {
        self.state.lock().await.doc.text()
    }

    pub async fn state_vector(&self) -> StateVector {
        self.state.lock().await.doc.state_vector().clone()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.doc.pending_len()
    }

    /// Whether changes exist that no flush has written yet.
    pub async fn is_dirty(&self) -> bool {
        let state = self.state.lock().await;
        state.version != state.flushed_version
    }

    /// StateResponse for a peer at `peer`.
    pub async fn state_response(&self, peer: &StateVector) -> SyncMessage {
        let state = self.state.lock().await;
        SyncMessage::StateResponse {
            operations: state.doc.diff_since(peer),
            state_vector: state.doc.state_vector().clone(),
        }
    }

    /// Integrate operations from `origin` and relay what was integrated.
    pub async fn apply_operations(
        self: &Arc<Self>,
        origin: SessionId,
        ops: Vec<Operation>,
    ) -> UpdateSummary {
        let mut summary = UpdateSummary::default();
        let mut batches: Vec<(Option<SessionId>, Vec<Operation>)> = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            for op in ops {
                let id = op.id();
                let outcome = match state.doc.apply_remote(op) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        log::warn!("room {}: rejected operation {id} from {origin}: {e}", self.key);
                        summary.rejected += 1;
                        continue;
                    }
                };
                match outcome.status {
                    ApplyStatus::Duplicate => summary.duplicates += 1,
                    ApplyStatus::Pending => {
                        summary.buffered += 1;
                        state.pending_origins.insert(id, origin);
                    }
                    ApplyStatus::Applied => {}
                }
                for (i, integrated) in outcome.integrated.into_iter().enumerate() {
                    // The first integrated op is the one just received; the
                    // rest were released from the pending buffer.
                    let source = if i == 0 && outcome.status == ApplyStatus::Applied {
                        Some(origin)
                    } else {
                        state.pending_origins.remove(&integrated.id())
                    };
                    push_batched(&mut batches, source, integrated);
                    summary.integrated += 1;
                }
            }
            if summary.integrated > 0 {
                state.version += summary.integrated as u64;
                state.pending_origins.retain(|id, _| !state.doc.state_vector().contains(*id));
            }
            for (source, operations) in batches {
                if let Err(e) = self.broadcast.broadcast(source, &SyncMessage::Update { operations }) {
                    log::error!("room {}: failed to encode update: {e}", self.key);
                }
            }
        }
        if summary.integrated > 0 {
            self.persistence.on_document_changed(self);
        }
        summary
    }

    /// Apply a presence update from `origin` and relay the accepted part.
    pub async fn apply_presence(&self, origin: SessionId, update: &AwarenessUpdate) -> AwarenessChange {
        let mut state = self.state.lock().await;
        let (change, accepted) = state.awareness.apply_remote(update, Some(origin));
        if !accepted.is_empty() {
            if let Err(e) = self.broadcast.broadcast(Some(origin), &SyncMessage::Presence(accepted)) {
                log::error!("room {}: failed to encode presence: {e}", self.key);
            }
        }
        change
    }

    /// Full awareness state, for a newly joined session.
    pub async fn awareness_snapshot(&self) -> AwarenessUpdate {
        self.state.lock().await.awareness.encode_full()
    }

    pub async fn awareness_clients(&self) -> Vec<ClientId> {
        let state = self.state.lock().await;
        state.awareness.snapshot().into_iter().map(|e| e.client_id).collect()
    }

    /// Drop operations buffered longer than `max_age` and ask each session
    /// that sent one for a fresh handshake. Returns those sessions.
    pub async fn expire_pending(&self, max_age: Duration) -> Vec<SessionId> {
        let mut state = self.state.lock().await;
        let expired = state.doc.expire_pending(max_age);
        if expired.is_empty() {
            return Vec::new();
        }
        let mut sessions: Vec<SessionId> = Vec::new();
        for id in &expired {
            if let Some(session) = state.pending_origins.remove(id) {
                if state.sessions.contains(&session) && !sessions.contains(&session) {
                    sessions.push(session);
                }
            }
        }
        log::warn!(
            "room {}: dropped {} unresolved operations, resyncing {} sessions",
            self.key,
            expired.len(),
            sessions.len()
        );
        let request = SyncMessage::StateRequest {
            state_vector: state.doc.state_vector().clone(),
        };
        for session in &sessions {
            if let Err(e) = self.broadcast.send_to(*session, &request) {
                log::error!("room {}: failed to encode state request: {e}", self.key);
            }
        }
        sessions
    }

    /// Register a session and subscribe it, atomically with respect to
    /// broadcasts. Returns `None` if the room is full.
    async fn add_session(&self, session: SessionId, max: usize) -> Option<broadcast::Receiver<Frame>> {
        let mut state = self.state.lock().await;
        if state.sessions.len() >= max {
            return None;
        }
        state.sessions.insert(session);
        Some(self.broadcast.subscribe())
    }

    /// Unregister a session, removing and announcing its awareness entries.
    /// Returns the number of sessions left, or `None` if `session` was not a
    /// member.
    async fn remove_session(&self, session: SessionId) -> Option<usize> {
        let mut state = self.state.lock().await;
        if !state.sessions.remove(&session) {
            return None;
        }
        state.pending_origins.retain(|_, s| *s != session);
        let removal = state.awareness.remove_session(session);
        if !removal.is_empty() {
            if let Err(e) = self.broadcast.broadcast(Some(session), &SyncMessage::Presence(removal)) {
                log::error!("room {}: failed to encode presence removal: {e}", self.key);
            }
        }
        Some(state.sessions.len())
    }

    pub(crate) fn lock_flush_timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.flush_timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn flush_lock(&self) -> &Mutex<()> {
        &self.flush_lock
    }

    pub(crate) async fn capture_for_flush(&self, with_snapshot: bool) -> Option<FlushCapture> {
        let state = self.state.lock().await;
        if state.version == state.flushed_version {
            return None;
        }
        Some(FlushCapture {
            version: state.version,
            text: state.doc.text(),
            snapshot: with_snapshot.then(|| SnapshotRecord::capture(&self.file_id, &state.doc)),
        })
    }

    pub(crate) async fn mark_flushed(&self, version: u64) {
        let mut state = self.state.lock().await;
        state.flushed_version = state.flushed_version.max(version);
    }
}

fn push_batched(batches: &mut Vec<(Option<SessionId>, Vec<Operation>)>, source: Option<SessionId>, op: Operation) {
    match batches.last_mut() {
        Some((last, ops)) if *last == source => ops.push(op),
        _ => batches.push((source, vec![op])),
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RoomSlot {
    room: Mutex<Option<Arc<Room>>>,
    /// Set once the slot's room is torn down; joiners must fetch a new slot.
    retired: AtomicBool,
}

/// Maps room keys to live rooms.
pub struct RoomManager {
    slots: std::sync::Mutex<HashMap<String, Arc<RoomSlot>>>,
    store: Arc<dyn FileStore>,
    persistence: PersistenceCoordinator,
    config: RoomConfig,
    counters: Arc<ServerCounters>,
}

impl RoomManager {
    pub fn new(
        store: Arc<dyn FileStore>,
        persistence: PersistenceCoordinator,
        config: RoomConfig,
        counters: Arc<ServerCounters>,
    ) -> Self {
        Self {
            slots: std::sync::Mutex::new(HashMap::new()),
            store,
            persistence,
            config,
            counters,
        }
    }

    pub fn persistence(&self) -> &PersistenceCoordinator {
        &self.persistence
    }

    /// Resolve or create the room for `key` and register `session` in it.
    pub async fn join(
        &self,
        key: &str,
        session: SessionId,
    ) -> Result<(Arc<Room>, broadcast::Receiver<Frame>), ServerError> {
        let file_id = file_id_from_room_key(key)
            .ok_or_else(|| ServerError::InvalidRoom(key.to_string()))?
            .to_string();

        loop {
            let slot = Arc::clone(self.lock_slots().entry(key.to_string()).or_default());
            let mut guard = slot.room.lock().await;
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }

            let room = match guard.as_ref() {
                Some(room) => Arc::clone(room),
                None => match self.create_room(key, &file_id).await {
                    Ok(room) => {
                        *guard = Some(Arc::clone(&room));
                        self.counters.active_rooms.fetch_add(1, Ordering::Relaxed);
                        room
                    }
                    Err(e) => {
                        self.retire(key, &slot);
                        return Err(e);
                    }
                },
            };

            return match room.add_session(session, self.config.max_sessions).await {
                Some(rx) => {
                    log::info!("session {session} joined room {key}");
                    Ok((room, rx))
                }
                None => Err(ServerError::RoomFull {
                    room: key.to_string(),
                    max: self.config.max_sessions,
                }),
            };
        }
    }

    /// Remove `session` from the room. The last session out tears the room
    /// down after a final flush.
    pub async fn leave(&self, key: &str, session: SessionId) {
        let Some(slot) = self.lock_slots().get(key).cloned() else {
            return;
        };
        let mut guard = slot.room.lock().await;
        let Some(room) = guard.clone() else {
            return;
        };

        let Some(remaining) = room.remove_session(session).await else {
            log::debug!("session {session} already left room {key}");
            return;
        };
        log::info!("session {session} left room {key} ({remaining} remaining)");
        if remaining > 0 {
            return;
        }

        room.closed.store(true, Ordering::Release);
        self.persistence.cancel(&room);
        if room.is_dirty().await {
            self.persistence.flush_once(&room).await;
        }
        *guard = None;
        self.retire(key, &slot);
        self.counters.active_rooms.fetch_sub(1, Ordering::Relaxed);
        log::info!("room {key} closed");
    }

    /// Current text of `key`. Falls back to the store for rooms that are
    /// not live.
    pub async fn text_snapshot(&self, key: &str) -> Result<String, ServerError> {
        if let Some(room) = self.room(key).await {
            return Ok(room.text().await);
        }
        let file_id = file_id_from_room_key(key).ok_or_else(|| ServerError::InvalidRoom(key.to_string()))?;
        Ok(self.store.get_file(file_id).await?.content)
    }

    /// The live room for `key`, if any.
    pub async fn room(&self, key: &str) -> Option<Arc<Room>> {
        let slot = self.lock_slots().get(key).cloned()?;
        let guard = slot.room.lock().await;
        guard.clone()
    }

    /// Rooms that are open. A room still being seeded is not counted.
    pub fn room_count(&self) -> usize {
        self.counters.active_rooms.load(Ordering::Relaxed) as usize
    }

    /// Run [`Room::expire_pending`] on every live room.
    pub async fn expire_pending(&self, max_age: Duration) -> usize {
        let slots: Vec<Arc<RoomSlot>> = self.lock_slots().values().cloned().collect();
        let mut resynced = 0;
        for slot in slots {
            let room = slot.room.lock().await.clone();
            if let Some(room) = room {
                resynced += room.expire_pending(max_age).await.len();
            }
        }
        resynced
    }

    /// Flush every live room now, returning how many were written.
    pub async fn flush_all(&self) -> usize {
        let slots: Vec<Arc<RoomSlot>> = self.lock_slots().values().cloned().collect();
        let mut written = 0;
        for slot in slots {
            let room = slot.room.lock().await.clone();
            if let Some(room) = room {
                self.persistence.cancel(&room);
                if let FlushOutcome::Written { .. } = self.persistence.flush_once(&room).await {
                    written += 1;
                }
            }
        }
        written
    }

    async fn create_room(&self, key: &str, file_id: &str) -> Result<Arc<Room>, ServerError> {
        let record = self.store.get_file(file_id).await?;
        let client = ClientId::random();
        let doc = match self.recover_snapshot(key, file_id, client).await {
            Some((sequence, doc)) if doc.text() == record.content => {
                log::info!("room {key}: resumed from snapshot {sequence}");
                doc
            }
            Some((sequence, _)) => {
                log::info!("room {key}: snapshot {sequence} is stale, seeding from content");
                Document::from_text(client, &record.content)
            }
            None => Document::from_text(client, &record.content),
        };
        let doc = doc.with_max_pending(self.config.max_pending);

        log::info!("room {key} opened ({} chars)", doc.len());
        Ok(Arc::new(Room::new(
            key.to_string(),
            file_id.to_string(),
            doc,
            &self.config,
            self.persistence.clone(),
        )))
    }

    /// Newest usable snapshot of `file_id`. Only reads the whole log when
    /// the latest record is unusable.
    async fn recover_snapshot(&self, key: &str, file_id: &str, client: ClientId) -> Option<(u64, Document)> {
        let latest = match self.store.latest_snapshot(file_id).await {
            Ok(Some(latest)) => latest,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("room {key}: snapshot log unavailable: {e}");
                return None;
            }
        };
        let newest = latest.sequence;
        if let (Some(recovered), _) = recover_latest(file_id, std::slice::from_ref(&latest), client) {
            return Some(recovered);
        }

        let older: Vec<StoredSnapshot> = match self.store.snapshots(file_id).await {
            Ok(log) => log.into_iter().filter(|s| s.sequence < newest).collect(),
            Err(e) => {
                log::warn!("room {key}: snapshot log unavailable: {e}");
                return None;
            }
        };
        let (recovered, skipped) = recover_latest(file_id, &older, client);
        log::warn!("room {key}: skipped {} unreadable snapshots", skipped + 1);
        recovered
    }

    fn retire(&self, key: &str, slot: &Arc<RoomSlot>) {
        slot.retired.store(true, Ordering::Release);
        let mut slots = self.lock_slots();
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RoomSlot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
