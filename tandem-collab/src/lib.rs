//! # tandem-collab: Real-time collaboration layer for Tandem
//!
//! Rooms of replicated text documents synchronized over WebSockets, with
//! presence and debounced write-through to the file store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer   │
//! │ (per user)  │   bincode frames    │ (central)    │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │ one Session per connection
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ Document    │                     │ Room         │── AwarenessTable
//! │ (replica)   │                     │ (authority)  │── BroadcastGroup (fan-out)
//! └─────────────┘                     └──────┬───────┘
//!                                            │ debounced
//!                                     ┌──────┴────────────────┐
//!                                     │ PersistenceCoordinator│
//!                                     │  → dyn FileStore      │
//!                                     └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`awareness`]: Presence table with per-client clocks
//! - [`broadcast`]: Room fan-out with bounded per-session queues
//! - [`room`]: Room lifecycle, seeding and relay ordering
//! - [`session`]: Per-connection handshake state machine
//! - [`persistence`]: Debounced flushes and the snapshot log
//! - [`storage`]: File store trait with in-memory and RocksDB adapters
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Frame encode/decode (small update) | <1μs |
//! | Broadcast 1K frames × 100 peers | <10ms |
//! | Room seed from snapshot (10K chars) | <5ms |

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod persistence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{
    presence_color, AwarenessChange, AwarenessEntry, AwarenessTable, AwarenessUpdate, CursorRange,
    SessionId, UserPresence,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use persistence::{FlushOutcome, PersistenceCoordinator, SNAPSHOT_RETENTION};
pub use protocol::{
    file_id_from_room_key, room_key_for_file, room_key_from_path, MessageType, ProtocolError,
    SyncMessage,
};
pub use room::{Room, RoomConfig, RoomManager, UpdateSummary};
pub use server::{ServerConfig, ServerCounters, ServerError, ServerStats, SyncServer};
pub use session::{CloseReason, Session, SessionLimits, SessionState};
pub use storage::{
    FileRecord, FileStore, MemoryStore, RocksStore, SnapshotError, SnapshotRecord, StoreConfig,
    StoreError, StoredSnapshot,
};
