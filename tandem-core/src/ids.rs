//! Replica and character identifiers.
//!
//! Every character ever inserted into a document is named by an
//! [`ItemId`]: the replica that typed it plus that replica's local clock at
//! the time. Ids are never reused, so they survive concurrent edits and
//! deletion (tombstones keep their id).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one replica (site). Ordering is the tie-break used when two
/// replicas insert at the same logical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Fresh random id, derived from a v4 UUID.
    pub fn random() -> Self {
        Self((Uuid::new_v4().as_u128() >> 64) as u64)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique id of a single clock unit (one character or one delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub client: ClientId,
    pub clock: u64,
}

impl ItemId {
    pub fn new(client: ClientId, clock: u64) -> Self {
        Self { client, clock }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.client, self.clock)
    }
}

/// A contiguous run of clocks `clock .. clock + len` from one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRange {
    pub client: ClientId,
    pub clock: u64,
    pub len: u64,
}

impl ItemRange {
    pub fn new(client: ClientId, clock: u64, len: u64) -> Self {
        Self { client, clock, len }
    }

    pub fn start(&self) -> ItemId {
        ItemId::new(self.client, self.clock)
    }

    /// Id of the last clock unit in the range. Only meaningful for `len > 0`.
    pub fn last(&self) -> ItemId {
        ItemId::new(self.client, self.clock + self.len.saturating_sub(1))
    }

    pub fn end(&self) -> u64 {
        self.clock + self.len
    }

    pub fn contains(&self, id: ItemId) -> bool {
        id.client == self.client && id.clock >= self.clock && id.clock < self.end()
    }
}
