//! Fan-out of encoded frames to every session in a room.
//!
//! One bounded tokio broadcast channel per room; each session's receiver is
//! its outbound queue. A frame is encoded once and shared by all receivers.
//! Origin exclusion and directed delivery happen on the receiving side
//! ([`Frame::is_for`]), so sending never takes a lock.
//!
//! A receiver that falls more than `capacity` frames behind observes
//! `RecvError::Lagged`; the session task treats that as fatal and
//! disconnects the peer rather than stalling everyone else.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::awareness::SessionId;
use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded frame plus its routing.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Session that caused the frame; never delivered back to it.
    pub origin: Option<SessionId>,
    /// If set, only this session receives the frame.
    pub target: Option<SessionId>,
    pub bytes: Arc<Vec<u8>>,
}

impl Frame {
    pub fn is_for(&self, session: SessionId) -> bool {
        if self.origin == Some(session) {
            return false;
        }
        match self.target {
            Some(target) => target == session,
            None => true,
        }
    }
}

/// Snapshot of fan-out counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub lagged_receivers: u64,
    pub receivers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    lagged_receivers: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` bounds each receiver's queue.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Encode `msg` once and send it to every session except `origin`.
    /// Returns the number of live receivers.
    pub fn broadcast(&self, origin: Option<SessionId>, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.send(Frame {
            origin,
            target: None,
            bytes,
        }))
    }

    /// Send `msg` to a single session.
    pub fn send_to(&self, target: SessionId, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.send(Frame {
            origin: None,
            target: Some(target),
            bytes,
        }))
    }

    /// Send pre-encoded bytes room-wide.
    pub fn broadcast_raw(&self, origin: Option<SessionId>, bytes: Arc<Vec<u8>>) -> usize {
        self.send(Frame {
            origin,
            target: None,
            bytes,
        })
    }

    fn send(&self, frame: Frame) -> usize {
        let len = frame.bytes.len() as u64;
        // No receivers is not an error: the room may be between sessions.
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        count
    }

    /// Called by a session task whose receiver lagged.
    pub fn record_lagged(&self) {
        self.stats.lagged_receivers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            lagged_receivers: self.stats.lagged_receivers.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}
