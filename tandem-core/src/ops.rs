//! Operations exchanged between replicas.
//!
//! ```text
//! Insert { id: A@5, origin_left: B@2, origin_right: A@1, "xyz" }
//!   occupies clocks A@5, A@6, A@7, one per character
//!
//! Delete { id: A@8, target: B@0..B@3 }
//!   occupies clock A@8, tombstones B@0, B@1, B@2
//! ```
//!
//! Origins are the neighbours the inserting replica saw at the time, not
//! positions, so an insert can be placed correctly on a replica whose text
//! has since shifted.

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, ItemId, ItemRange};
use crate::state_vector::StateVector;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// A run of characters with consecutive clocks starting at `id`.
    Insert {
        id: ItemId,
        origin_left: Option<ItemId>,
        origin_right: Option<ItemId>,
        content: String,
    },
    /// Tombstones every character in `target`. Consumes one clock unit.
    Delete { id: ItemId, target: ItemRange },
}

impl Operation {
    pub fn id(&self) -> ItemId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => *id,
        }
    }

    pub fn client(&self) -> ClientId {
        self.id().client
    }

    /// Number of clock units this operation occupies.
    pub fn len(&self) -> u64 {
        match self {
            Operation::Insert { content, .. } => content.chars().count() as u64,
            Operation::Delete { .. } => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clock just past this operation.
    pub fn end(&self) -> u64 {
        self.id().clock.saturating_add(self.len())
    }

    /// Ids that must already be integrated before this operation can be.
    pub fn dependencies(&self) -> Vec<ItemId> {
        match self {
            Operation::Insert {
                origin_left,
                origin_right,
                ..
            } => origin_left.iter().chain(origin_right.iter()).copied().collect(),
            Operation::Delete { target, .. } => vec![target.last()],
        }
    }

    /// Drop the first `skip` clock units. Only inserts can be partially
    /// known; the trimmed run is anchored on the last skipped character.
    pub fn trim_front(&self, skip: u64) -> Operation {
        match self {
            Operation::Insert {
                id,
                origin_right,
                content,
                ..
            } if skip > 0 => {
                let content: String = content.chars().skip(skip as usize).collect();
                Operation::Insert {
                    id: ItemId::new(id.client, id.clock + skip),
                    origin_left: Some(ItemId::new(id.client, id.clock + skip - 1)),
                    origin_right: *origin_right,
                    content,
                }
            }
            other => other.clone(),
        }
    }

    /// The part of this operation a peer at `sv` has not observed, if any.
    pub fn missing_for(&self, sv: &StateVector) -> Option<Operation> {
        let known = sv.get(self.client());
        let start = self.id().clock;
        if known >= self.end() {
            None
        } else if known > start {
            Some(self.trim_front(known - start))
        } else {
            Some(self.clone())
        }
    }
}
