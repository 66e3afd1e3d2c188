//! Per-connection state machine.
//!
//! ```text
//! CONNECTING ──join + send StateRequest(∅)──► HANDSHAKING
//! HANDSHAKING ──StateResponse applied──────► SYNCED
//! any ──transport close / fatal error──────► CLOSED (leave room)
//! ```
//!
//! A session is transport-agnostic: it consumes decoded-or-not frames and
//! returns the frames to write back. The server owns the socket.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::awareness::SessionId;
use crate::broadcast::Frame;
use crate::protocol::SyncMessage;
use crate::room::{Room, RoomManager, UpdateSummary};
use crate::server::{ServerCounters, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Synced,
    Closed,
}

/// Why a session was closed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Too many consecutive frames failed to decode.
    DecodeFailures(u32),
    /// Too many operations rejected as malformed.
    RejectedOperations(usize),
    /// The outbound queue overflowed.
    Lagged(u64),
    /// Encoding a reply failed.
    Internal(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::DecodeFailures(n) => write!(f, "{n} consecutive undecodable frames"),
            CloseReason::RejectedOperations(n) => write!(f, "{n} rejected operations"),
            CloseReason::Lagged(n) => write!(f, "outbound queue overflowed by {n} frames"),
            CloseReason::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

/// Thresholds after which a misbehaving session is closed.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub decode_failure_threshold: u32,
    pub rejected_ops_threshold: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            decode_failure_threshold: 5,
            rejected_ops_threshold: 16,
        }
    }
}

pub struct Session {
    id: SessionId,
    room_key: String,
    room: Arc<Room>,
    manager: Arc<RoomManager>,
    state: SessionState,
    limits: SessionLimits,
    decode_failures: u32,
    rejected_ops: usize,
    counters: Arc<ServerCounters>,
}

/// A freshly joined session, its outbound receiver, and the frames to send
/// before anything else.
pub struct OpenedSession {
    pub session: Session,
    pub outbound: broadcast::Receiver<Frame>,
    pub initial_frames: Vec<Vec<u8>>,
}

impl Session {
    /// Join `room_key` and prepare the opening handshake.
    pub async fn open(
        manager: Arc<RoomManager>,
        room_key: &str,
        limits: SessionLimits,
        counters: Arc<ServerCounters>,
    ) -> Result<OpenedSession, ServerError> {
        let id = Uuid::new_v4();
        let (room, outbound) = manager.join(room_key, id).await?;

        let mut session = Session {
            id,
            room_key: room_key.to_string(),
            room,
            manager,
            state: SessionState::Connecting,
            limits,
            decode_failures: 0,
            rejected_ops: 0,
            counters,
        };

        let mut initial_frames = Vec::with_capacity(2);
        let request = SyncMessage::request_all().encode();
        let awareness = session.room.awareness_snapshot().await;
        let presence = (!awareness.is_empty()).then(|| SyncMessage::Presence(awareness).encode());
        match (request, presence.transpose()) {
            (Ok(request), Ok(presence)) => {
                initial_frames.push(request);
                initial_frames.extend(presence);
            }
            (Err(e), _) | (_, Err(e)) => {
                session.close().await;
                return Err(e.into());
            }
        }
        session.state = SessionState::Handshaking;

        Ok(OpenedSession {
            session,
            outbound,
            initial_frames,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Whether a broadcast frame should be written to this session.
    pub fn wants(&self, frame: &Frame) -> bool {
        frame.is_for(self.id)
    }

    /// Handle one inbound binary frame. Returns frames to send back to this
    /// peer only; room-wide relays go through the broadcast group.
    pub async fn handle_frame(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, CloseReason> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => {
                self.decode_failures = 0;
                msg
            }
            Err(e) => {
                log::warn!("session {}: dropping undecodable frame: {e}", self.id);
                return self.record_decode_failure().map(|_| Vec::new());
            }
        };
        log::trace!("session {}: {:?} frame", self.id, msg.message_type());

        match msg {
            SyncMessage::StateRequest { state_vector } => {
                let response = self.room.state_response(&state_vector).await;
                let encoded = response
                    .encode()
                    .map_err(|e| CloseReason::Internal(e.to_string()))?;
                Ok(vec![encoded])
            }
            SyncMessage::StateResponse { operations, .. } => {
                let summary = self.room.apply_operations(self.id, operations).await;
                self.check_rejections(summary)?;
                if self.state == SessionState::Handshaking {
                    self.state = SessionState::Synced;
                    log::debug!("session {} synced with room {}", self.id, self.room_key);
                }
                Ok(Vec::new())
            }
            SyncMessage::Update { operations } => {
                let summary = self.room.apply_operations(self.id, operations).await;
                self.check_rejections(summary)?;
                Ok(Vec::new())
            }
            SyncMessage::Presence(update) => {
                self.room.apply_presence(self.id, &update).await;
                Ok(Vec::new())
            }
        }
    }

    /// Count a frame that could not be decoded (or was not binary).
    pub fn record_decode_failure(&mut self) -> Result<(), CloseReason> {
        self.decode_failures += 1;
        if self.decode_failures >= self.limits.decode_failure_threshold {
            return Err(CloseReason::DecodeFailures(self.decode_failures));
        }
        Ok(())
    }

    fn check_rejections(&mut self, summary: UpdateSummary) -> Result<(), CloseReason> {
        if summary.rejected == 0 {
            return Ok(());
        }
        self.counters
            .rejected_operations
            .fetch_add(summary.rejected as u64, Ordering::Relaxed);
        self.rejected_ops += summary.rejected;
        if self.rejected_ops > self.limits.rejected_ops_threshold {
            return Err(CloseReason::RejectedOperations(self.rejected_ops));
        }
        Ok(())
    }

    /// Leave the room. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.manager.leave(&self.room_key, self.id).await;
    }
}
