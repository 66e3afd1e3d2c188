//! Replicated text document.
//!
//! ## Layout
//!
//! ```text
//!  head
//!   │
//!   ▼
//! ┌────────┐   ┌────────┐   ┌────────┐   ┌────────┐
//! │ A@0..3 │──►│ B@0..2 │──►│ A@3..4 │──►│ C@0..5 │──► None
//! │ "Hel"  │   │ "xy" † │   │ "l"    │   │ "lo, w"│
//! └────────┘   └────────┘   └────────┘   └────────┘
//!   blocks: Vec<Block>    († = tombstone, never removed)
//!
//! index: client → BTreeMap<clock_start, block index>
//! ```
//!
//! Blocks live in an arena and are linked by index, so splitting a run
//! never invalidates other references. Remote inserts are placed by their
//! origins (the neighbours the author saw) and concurrent inserts between
//! the same origins are ordered by client id, which makes integration
//! commutative. Operations are integrated in per-client clock order; anything
//! that arrives early waits in a bounded pending buffer.
//!
//! Reference: Nicolaescu et al., Near Real-Time Peer-to-Peer Shared Editing
//! on Extensible Data Types (YATA)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::ids::{ClientId, ItemId, ItemRange};
use crate::ops::Operation;
use crate::state_vector::StateVector;

/// Default bound on operations waiting for their predecessors.
pub const DEFAULT_MAX_PENDING: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("position {position} out of bounds for document of length {len}")]
    OutOfBounds { position: usize, len: usize },
    #[error("cannot insert empty text")]
    EmptyInsert,
    #[error("malformed operation {id}: {reason}")]
    Malformed { id: ItemId, reason: &'static str },
    #[error("pending buffer full ({0} operations waiting)")]
    PendingOverflow(usize),
    #[error("state encoding failed: {0}")]
    Encode(String),
    #[error("state decoding failed: {0}")]
    Decode(String),
    #[error("encoded state left {0} operations unresolved")]
    IncompleteState(usize),
}

/// A positional edit against the visible text, relative to the text as it
/// stood when the change was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextChange {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Integrated (possibly releasing buffered operations).
    Applied,
    /// Already observed; no effect.
    Duplicate,
    /// Buffered until its predecessors arrive.
    Pending,
}

/// Result of [`Document::apply_remote`].
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub status: ApplyStatus,
    /// Operations integrated by this call, in integration order. Includes
    /// any buffered operations the call released.
    pub integrated: Vec<Operation>,
    pub changes: Vec<TextChange>,
}

impl ApplyOutcome {
    fn with_status(status: ApplyStatus) -> Self {
        Self {
            status,
            integrated: Vec::new(),
            changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Block {
    id: ItemId,
    origin_left: Option<ItemId>,
    origin_right: Option<ItemId>,
    content: String,
    /// Length in chars (clock units).
    len: u64,
    deleted: bool,
    right: Option<usize>,
}

impl Block {
    fn last_id(&self) -> ItemId {
        ItemId::new(self.id.client, self.id.clock + self.len - 1)
    }

    fn contains(&self, id: ItemId) -> bool {
        id.client == self.id.client && id.clock >= self.id.clock && id.clock < self.id.clock + self.len
    }

    fn visible_len(&self) -> u64 {
        if self.deleted {
            0
        } else {
            self.len
        }
    }
}

#[derive(Debug, Clone)]
struct PendingOp {
    op: Operation,
    received: Instant,
}

enum Readiness {
    Duplicate,
    Ready,
    Blocked,
}

#[derive(Serialize)]
struct EncodedStateRef<'a> {
    operations: &'a [Operation],
}

#[derive(Deserialize)]
struct EncodedState {
    operations: Vec<Operation>,
}

/// One replica of a text document.
#[derive(Debug, Clone)]
pub struct Document {
    client: ClientId,
    blocks: Vec<Block>,
    head: Option<usize>,
    index: HashMap<ClientId, BTreeMap<u64, usize>>,
    state: StateVector,
    /// Every integrated operation, in integration order.
    log: Vec<Operation>,
    pending: Vec<PendingOp>,
    max_pending: usize,
    /// Visible length in chars.
    visible: usize,
}

impl Document {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            blocks: Vec::new(),
            head: None,
            index: HashMap::new(),
            state: StateVector::new(),
            log: Vec::new(),
            pending: Vec::new(),
            max_pending: DEFAULT_MAX_PENDING,
            visible: 0,
        }
    }

    /// Seed a document from plain text, authored by `client`.
    pub fn from_text(client: ClientId, text: &str) -> Self {
        let mut doc = Self::new(client);
        if !text.is_empty() {
            doc.local_insert(0, text);
        }
        doc
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Visible length in chars.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let block = &self.blocks[idx];
            if !block.deleted {
                out.push_str(&block.content);
            }
            cursor = block.right;
        }
        out
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn operation_count(&self) -> usize {
        self.log.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    // ─── Local edits ─────────────────────────────────────────────────

    /// Insert `text` at visible char `position`. Returns the operation to
    /// broadcast.
    pub fn insert(&mut self, position: usize, text: &str) -> Result<Operation, DocError> {
        if text.is_empty() {
            return Err(DocError::EmptyInsert);
        }
        if position > self.visible {
            return Err(DocError::OutOfBounds {
                position,
                len: self.visible,
            });
        }
        Ok(self.local_insert(position, text))
    }

    /// Delete `len` visible chars starting at `position`. Returns one
    /// operation per contiguous run of character ids covered.
    pub fn delete(&mut self, position: usize, len: usize) -> Result<Vec<Operation>, DocError> {
        let end = position.checked_add(len);
        if end.map_or(true, |end| end > self.visible) {
            return Err(DocError::OutOfBounds {
                position,
                len: self.visible,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut runs: Vec<ItemRange> = Vec::new();
        for idx in self.visible_range(position as u64, len as u64) {
            let block = &self.blocks[idx];
            match runs.last_mut() {
                Some(run) if run.client == block.id.client && run.end() == block.id.clock => {
                    run.len += block.len;
                }
                _ => runs.push(ItemRange::new(block.id.client, block.id.clock, block.len)),
            }
        }

        let mut ops = Vec::with_capacity(runs.len());
        for target in runs {
            let op = Operation::Delete {
                id: ItemId::new(self.client, self.state.get(self.client)),
                target,
            };
            self.integrate(&op)?;
            ops.push(op);
        }
        Ok(ops)
    }

    fn local_insert(&mut self, position: usize, text: &str) -> Operation {
        let (left, right) = self.neighbours_at(position as u64);
        let op = Operation::Insert {
            id: ItemId::new(self.client, self.state.get(self.client)),
            origin_left: left.map(|idx| self.blocks[idx].last_id()),
            origin_right: right.map(|idx| self.blocks[idx].id),
            content: text.to_string(),
        };
        if let Err(e) = self.integrate(&op) {
            log::error!("local insert {} failed to integrate: {e}", op.id());
        }
        op
    }

    // ─── Remote integration ──────────────────────────────────────────

    /// Integrate an operation from another replica.
    ///
    /// Duplicates are detected by id and have no effect. Operations whose
    /// predecessors are missing are buffered and integrated automatically
    /// once those arrive.
    pub fn apply_remote(&mut self, op: Operation) -> Result<ApplyOutcome, DocError> {
        validate(&op)?;
        match self.readiness(&op) {
            Readiness::Duplicate => Ok(ApplyOutcome::with_status(ApplyStatus::Duplicate)),
            Readiness::Blocked => {
                if self.pending.iter().any(|p| p.op.id() == op.id()) {
                    return Ok(ApplyOutcome::with_status(ApplyStatus::Duplicate));
                }
                if self.pending.len() >= self.max_pending {
                    return Err(DocError::PendingOverflow(self.pending.len()));
                }
                log::debug!("buffering {} awaiting predecessors", op.id());
                self.pending.push(PendingOp {
                    op,
                    received: Instant::now(),
                });
                Ok(ApplyOutcome::with_status(ApplyStatus::Pending))
            }
            Readiness::Ready => {
                let mut outcome = ApplyOutcome::with_status(ApplyStatus::Applied);
                self.integrate_remote(op, &mut outcome)?;
                self.release_pending(&mut outcome);
                Ok(outcome)
            }
        }
    }

    /// Drop buffered operations older than `max_age`, returning their ids.
    pub fn expire_pending(&mut self, max_age: Duration) -> Vec<ItemId> {
        let now = Instant::now();
        let (expired, kept): (Vec<PendingOp>, Vec<PendingOp>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| now.duration_since(p.received) >= max_age);
        self.pending = kept;
        expired.into_iter().map(|p| p.op.id()).collect()
    }

    /// Operations a peer at `peer` has not observed, in an order it can
    /// integrate directly.
    pub fn diff_since(&self, peer: &StateVector) -> Vec<Operation> {
        self.log.iter().filter_map(|op| op.missing_for(peer)).collect()
    }

    fn readiness(&self, op: &Operation) -> Readiness {
        let next = self.state.get(op.client());
        if op.end() <= next {
            Readiness::Duplicate
        } else if op.id().clock > next {
            Readiness::Blocked
        } else if op.dependencies().iter().all(|dep| self.state.contains(*dep)) {
            Readiness::Ready
        } else {
            Readiness::Blocked
        }
    }

    fn integrate_remote(&mut self, op: Operation, outcome: &mut ApplyOutcome) -> Result<(), DocError> {
        let known = self.state.get(op.client());
        let op = if known > op.id().clock {
            op.trim_front(known - op.id().clock)
        } else {
            op
        };
        let changes = self.integrate(&op)?;
        outcome.changes.extend(changes);
        outcome.integrated.push(op);
        Ok(())
    }

    fn release_pending(&mut self, outcome: &mut ApplyOutcome) {
        loop {
            let Some(pos) = self.next_unblocked() else {
                break;
            };
            let pending = self.pending.remove(pos);
            if let Readiness::Ready = self.readiness(&pending.op) {
                let id = pending.op.id();
                if let Err(e) = self.integrate_remote(pending.op, outcome) {
                    log::warn!("released operation {id} failed to integrate: {e}");
                }
            }
        }
    }

    fn next_unblocked(&self) -> Option<usize> {
        self.pending
            .iter()
            .position(|p| !matches!(self.readiness(&p.op), Readiness::Blocked))
    }

    /// Apply a ready operation to the structure and record it.
    fn integrate(&mut self, op: &Operation) -> Result<Vec<TextChange>, DocError> {
        let changes = match op {
            Operation::Insert {
                id,
                origin_left,
                origin_right,
                content,
            } => {
                let idx = self.integrate_insert(*id, *origin_left, *origin_right, content)?;
                vec![TextChange::Insert {
                    index: self.visible_index(idx),
                    text: content.clone(),
                }]
            }
            Operation::Delete { id, target } => self.integrate_delete(*id, *target)?,
        };
        self.state.advance(op.client(), op.end());
        self.log.push(op.clone());
        Ok(changes)
    }

    fn integrate_insert(
        &mut self,
        id: ItemId,
        origin_left: Option<ItemId>,
        origin_right: Option<ItemId>,
        content: &str,
    ) -> Result<usize, DocError> {
        let unresolved = DocError::Malformed {
            id,
            reason: "origin not integrated",
        };
        let mut left = match origin_left {
            Some(origin) => Some(self.split_at_end(origin).ok_or_else(|| unresolved.clone())?),
            None => None,
        };
        let right = match origin_right {
            Some(origin) => Some(self.split_at_start(origin).ok_or(unresolved)?),
            None => None,
        };

        // Scan the blocks between the origins for concurrent inserts and
        // settle on the left neighbour.
        let mut cursor = match left {
            Some(l) => self.blocks[l].right,
            None => self.head,
        };
        let mut before_origin: HashSet<usize> = HashSet::new();
        let mut conflicting: HashSet<usize> = HashSet::new();
        while let Some(o) = cursor {
            if Some(o) == right {
                break;
            }
            before_origin.insert(o);
            conflicting.insert(o);
            let other = &self.blocks[o];
            if other.origin_left == origin_left {
                if other.id.client < id.client {
                    left = Some(o);
                    conflicting.clear();
                } else if other.origin_right == origin_right {
                    break;
                }
            } else if let Some(origin_block) = other
                .origin_left
                .and_then(|ol| self.find(ol))
                .filter(|b| before_origin.contains(b))
            {
                if !conflicting.contains(&origin_block) {
                    left = Some(o);
                    conflicting.clear();
                }
            } else {
                break;
            }
            cursor = self.blocks[o].right;
        }

        let new_idx = self.blocks.len();
        let len = content.chars().count() as u64;
        let next = match left {
            Some(l) => self.blocks[l].right,
            None => self.head,
        };
        self.blocks.push(Block {
            id,
            origin_left,
            origin_right,
            content: content.to_string(),
            len,
            deleted: false,
            right: next,
        });
        match left {
            Some(l) => self.blocks[l].right = Some(new_idx),
            None => self.head = Some(new_idx),
        }
        self.index.entry(id.client).or_default().insert(id.clock, new_idx);
        self.visible += len as usize;
        Ok(new_idx)
    }

    fn integrate_delete(&mut self, id: ItemId, target: ItemRange) -> Result<Vec<TextChange>, DocError> {
        let unresolved = DocError::Malformed {
            id,
            reason: "delete target not integrated",
        };
        self.split_at_start(target.start()).ok_or_else(|| unresolved.clone())?;
        self.split_at_end(target.last()).ok_or(unresolved)?;

        let covered: Vec<usize> = self
            .index
            .get(&target.client)
            .map(|starts| starts.range(target.clock..target.end()).map(|(_, idx)| *idx).collect())
            .unwrap_or_default();

        let mut changes: Vec<TextChange> = Vec::new();
        for idx in covered {
            if self.blocks[idx].deleted {
                continue;
            }
            let index = self.visible_index(idx);
            let len = self.blocks[idx].len as usize;
            self.blocks[idx].deleted = true;
            self.visible -= len;
            match changes.last_mut() {
                Some(TextChange::Delete { index: last, len: run }) if *last == index => *run += len,
                _ => changes.push(TextChange::Delete { index, len }),
            }
        }
        Ok(changes)
    }

    // ─── Structure helpers ───────────────────────────────────────────

    /// Block containing `id`.
    fn find(&self, id: ItemId) -> Option<usize> {
        let starts = self.index.get(&id.client)?;
        let (_, idx) = starts.range(..=id.clock).next_back()?;
        self.blocks[*idx].contains(id).then_some(*idx)
    }

    /// Split block `idx` after `offset` chars; returns the right half.
    fn split(&mut self, idx: usize, offset: u64) -> usize {
        let new_idx = self.blocks.len();
        let block = &mut self.blocks[idx];
        let byte = byte_offset(&block.content, offset);
        let tail = block.content.split_off(byte);
        let id = ItemId::new(block.id.client, block.id.clock + offset);
        let right_half = Block {
            id,
            origin_left: Some(ItemId::new(id.client, id.clock - 1)),
            origin_right: block.origin_right,
            content: tail,
            len: block.len - offset,
            deleted: block.deleted,
            right: block.right,
        };
        block.len = offset;
        block.right = Some(new_idx);
        self.index.entry(id.client).or_default().insert(id.clock, new_idx);
        self.blocks.push(right_half);
        new_idx
    }

    /// Ensure a block starts exactly at `id`; returns it.
    fn split_at_start(&mut self, id: ItemId) -> Option<usize> {
        let idx = self.find(id)?;
        let offset = id.clock - self.blocks[idx].id.clock;
        Some(if offset == 0 { idx } else { self.split(idx, offset) })
    }

    /// Ensure a block ends exactly at `id`; returns it.
    fn split_at_end(&mut self, id: ItemId) -> Option<usize> {
        let idx = self.find(id)?;
        let offset = id.clock - self.blocks[idx].id.clock + 1;
        if offset < self.blocks[idx].len {
            self.split(idx, offset);
        }
        Some(idx)
    }

    /// Blocks immediately left and right of visible position `pos`.
    fn neighbours_at(&mut self, pos: u64) -> (Option<usize>, Option<usize>) {
        if pos == 0 {
            return (None, self.head);
        }
        let mut remaining = pos;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let visible = self.blocks[idx].visible_len();
            if visible > 0 && remaining <= visible {
                if remaining < visible {
                    self.split(idx, remaining);
                }
                return (Some(idx), self.blocks[idx].right);
            }
            remaining -= visible;
            cursor = self.blocks[idx].right;
        }
        (None, self.head)
    }

    /// Split as needed and return the blocks covering visible
    /// `pos .. pos + len`, in document order.
    fn visible_range(&mut self, pos: u64, len: u64) -> Vec<usize> {
        let mut covered = Vec::new();
        let mut skip = pos;
        let mut remaining = len;
        let mut cursor = self.head;
        while let Some(mut idx) = cursor {
            if remaining == 0 {
                break;
            }
            let visible = self.blocks[idx].visible_len();
            if visible == 0 || skip >= visible {
                skip -= skip.min(visible);
                cursor = self.blocks[idx].right;
                continue;
            }
            if skip > 0 {
                idx = self.split(idx, skip);
                skip = 0;
            }
            let available = self.blocks[idx].len;
            if remaining < available {
                self.split(idx, remaining);
            }
            remaining -= remaining.min(available);
            covered.push(idx);
            cursor = self.blocks[idx].right;
        }
        covered
    }

    /// Number of visible chars before block `idx`.
    fn visible_index(&self, idx: usize) -> usize {
        let mut index = 0u64;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if i == idx {
                break;
            }
            index += self.blocks[i].visible_len();
            cursor = self.blocks[i].right;
        }
        index as usize
    }

    // ─── Encoding ────────────────────────────────────────────────────

    /// Encode the full operation history. Decoding it reproduces a replica
    /// with the same text, state vector and tombstones.
    pub fn encode_state(&self) -> Result<Vec<u8>, DocError> {
        let state = EncodedStateRef {
            operations: &self.log,
        };
        bincode::serde::encode_to_vec(&state, bincode::config::standard())
            .map_err(|e| DocError::Encode(e.to_string()))
    }

    /// Rebuild a replica from [`Document::encode_state`] output. `client` is
    /// the id the rebuilt replica will author new edits under.
    pub fn decode_state(client: ClientId, bytes: &[u8]) -> Result<Self, DocError> {
        let (state, _): (EncodedState, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| DocError::Decode(e.to_string()))?;
        let mut doc = Self::new(client).with_max_pending(state.operations.len().max(DEFAULT_MAX_PENDING));
        for op in state.operations {
            doc.apply_remote(op)?;
        }
        if !doc.pending.is_empty() {
            return Err(DocError::IncompleteState(doc.pending.len()));
        }
        Ok(doc)
    }
}

fn validate(op: &Operation) -> Result<(), DocError> {
    let id = op.id();
    let malformed = |reason: &'static str| DocError::Malformed { id, reason };
    match op {
        Operation::Insert { content, .. } => {
            if content.is_empty() {
                return Err(malformed("empty insert"));
            }
            id.clock.checked_add(op.len()).ok_or_else(|| malformed("clock overflow"))?;
        }
        Operation::Delete { target, .. } => {
            if target.len == 0 {
                return Err(malformed("empty delete target"));
            }
            target
                .clock
                .checked_add(target.len)
                .ok_or_else(|| malformed("target overflow"))?;
        }
    }
    id.clock.checked_add(1).ok_or_else(|| malformed("clock overflow"))?;
    if op
        .dependencies()
        .iter()
        .any(|dep| dep.client == id.client && dep.clock >= id.clock)
    {
        return Err(malformed("references its own future"));
    }
    Ok(())
}

fn byte_offset(s: &str, chars: u64) -> usize {
    s.char_indices()
        .nth(chars as usize)
        .map(|(byte, _)| byte)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);
    const C: ClientId = ClientId(3);

    fn sync(from: &Document, to: &mut Document) {
        let ops = from.diff_since(to.state_vector());
        for op in ops {
            to.apply_remote(op).unwrap();
        }
    }

    #[test]
    fn test_local_insert_and_delete() {
        let mut doc = Document::new(A);
        doc.insert(0, "Hello world").unwrap();
        doc.insert(5, ",").unwrap();
        assert_eq!(doc.text(), "Hello, world");

        let ops = doc.delete(5, 7).unwrap();
        assert_eq!(ops.len(), 2, "deleted range spans two runs");
        assert_eq!(doc.text(), "Hello");
        assert_eq!(doc.len(), 5);
        assert_eq!(doc.state_vector().get(A), 14);
    }

    #[test]
    fn test_concurrent_inserts_at_same_position_converge() {
        let mut a = Document::new(A);
        let mut b = Document::new(B);
        let op_a = a.insert(0, "Hello").unwrap();
        let op_b = b.insert(0, "Hi ").unwrap();

        a.apply_remote(op_b).unwrap();
        b.apply_remote(op_a).unwrap();

        assert_eq!(a.text(), b.text());
        // Lower client id ends up first.
        assert_eq!(a.text(), "HelloHi ");
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let mut a = Document::new(A);
        let mut b = Document::new(B);
        let op = a.insert(0, "abc").unwrap();

        let first = b.apply_remote(op.clone()).unwrap();
        assert_eq!(first.status, ApplyStatus::Applied);
        let second = b.apply_remote(op).unwrap();
        assert_eq!(second.status, ApplyStatus::Duplicate);
        assert!(second.integrated.is_empty());
        assert_eq!(b.text(), "abc");
        assert_eq!(b.operation_count(), 1);
    }

    #[test]
    fn test_out_of_order_operations_wait_for_predecessors() {
        let mut a = Document::new(A);
        let mut b = Document::new(B);
        let first = a.insert(0, "ab").unwrap();
        let second = a.insert(2, "c").unwrap();

        let outcome = b.apply_remote(second.clone()).unwrap();
        assert_eq!(outcome.status, ApplyStatus::Pending);
        assert_eq!(b.pending_len(), 1);
        assert_eq!(b.text(), "");

        // Re-delivery of a buffered op is a duplicate.
        let again = b.apply_remote(second).unwrap();
        assert_eq!(again.status, ApplyStatus::Duplicate);

        let outcome = b.apply_remote(first).unwrap();
        assert_eq!(outcome.status, ApplyStatus::Applied);
        assert_eq!(outcome.integrated.len(), 2);
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.text(), "abc");
    }

    #[test]
    fn test_insert_survives_concurrent_delete_of_surroundings() {
        let mut a = Document::new(A);
        a.insert(0, "abcdef").unwrap();
        let mut b = Document::new(B);
        sync(&a, &mut b);

        let delete = a.delete(1, 4).unwrap();
        let insert = b.insert(3, "X").unwrap();

        for op in delete {
            b.apply_remote(op).unwrap();
        }
        a.apply_remote(insert).unwrap();

        assert_eq!(a.text(), "aXf");
        assert_eq!(b.text(), "aXf");
    }

    #[test]
    fn test_three_way_concurrent_edits() {
        let mut a = Document::new(A);
        a.insert(0, "shared").unwrap();
        let mut b = Document::new(B);
        let mut c = Document::new(C);
        sync(&a, &mut b);
        sync(&a, &mut c);

        a.insert(3, "-a-").unwrap();
        b.insert(3, "-b-").unwrap();
        b.delete(0, 1).unwrap();
        c.insert(6, "!").unwrap();
        c.delete(2, 2).unwrap();

        for _ in 0..2 {
            sync(&a, &mut b);
            sync(&b, &mut c);
            sync(&c, &mut a);
        }
        assert_eq!(a.text(), b.text());
        assert_eq!(b.text(), c.text());
    }

    #[test]
    fn test_diff_since_returns_only_missing() {
        let mut a = Document::new(A);
        a.insert(0, "one").unwrap();
        let mut b = Document::new(B);
        sync(&a, &mut b);

        a.insert(3, " two").unwrap();
        let diff = a.diff_since(b.state_vector());
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].id(), ItemId::new(A, 3));
        assert!(a.diff_since(a.state_vector()).is_empty());
    }

    #[test]
    fn test_diff_from_empty_vector_rebuilds_text() {
        let mut a = Document::new(A);
        a.insert(0, "Hello").unwrap();
        a.delete(1, 2).unwrap();
        a.insert(1, "ipp").unwrap();

        let mut fresh = Document::new(B);
        for op in a.diff_since(&StateVector::new()) {
            fresh.apply_remote(op).unwrap();
        }
        assert_eq!(fresh.text(), a.text());
        assert_eq!(fresh.state_vector(), a.state_vector());
    }

    #[test]
    fn test_remote_changes_report_positions() {
        let mut a = Document::new(A);
        a.insert(0, "hello world").unwrap();
        let mut b = Document::new(B);
        sync(&a, &mut b);

        let insert = a.insert(5, ",").unwrap();
        let outcome = b.apply_remote(insert).unwrap();
        assert_eq!(
            outcome.changes,
            vec![TextChange::Insert {
                index: 5,
                text: ",".to_string()
            }]
        );

        let deletes = a.delete(6, 6).unwrap();
        let mut changes = Vec::new();
        for op in deletes {
            changes.extend(b.apply_remote(op).unwrap().changes);
        }
        assert_eq!(changes, vec![TextChange::Delete { index: 6, len: 6 }]);
        assert_eq!(b.text(), "hello,");
    }

    #[test]
    fn test_partially_known_insert_is_trimmed() {
        let mut b = Document::new(B);
        let prefix = Operation::Insert {
            id: ItemId::new(A, 0),
            origin_left: None,
            origin_right: None,
            content: "ab".to_string(),
        };
        b.apply_remote(prefix).unwrap();

        let overlapping = Operation::Insert {
            id: ItemId::new(A, 1),
            origin_left: Some(ItemId::new(A, 0)),
            origin_right: None,
            content: "bcd".to_string(),
        };
        let outcome = b.apply_remote(overlapping).unwrap();
        assert_eq!(outcome.status, ApplyStatus::Applied);
        assert_eq!(outcome.integrated[0].id(), ItemId::new(A, 2));
        assert_eq!(b.text(), "abcd");
        assert_eq!(b.state_vector().get(A), 4);
    }

    #[test]
    fn test_malformed_operations_rejected() {
        let mut doc = Document::new(B);
        let empty = Operation::Insert {
            id: ItemId::new(A, 0),
            origin_left: None,
            origin_right: None,
            content: String::new(),
        };
        assert!(matches!(doc.apply_remote(empty), Err(DocError::Malformed { .. })));

        let self_reference = Operation::Insert {
            id: ItemId::new(A, 3),
            origin_left: Some(ItemId::new(A, 3)),
            origin_right: None,
            content: "x".to_string(),
        };
        assert!(matches!(doc.apply_remote(self_reference), Err(DocError::Malformed { .. })));

        let empty_delete = Operation::Delete {
            id: ItemId::new(A, 0),
            target: ItemRange::new(C, 0, 0),
        };
        assert!(matches!(doc.apply_remote(empty_delete), Err(DocError::Malformed { .. })));
        assert_eq!(doc.pending_len(), 0);
    }

    #[test]
    fn test_pending_buffer_is_bounded() {
        let mut doc = Document::new(B).with_max_pending(2);
        for clock in 1..=2 {
            let op = Operation::Insert {
                id: ItemId::new(A, clock * 10),
                origin_left: None,
                origin_right: None,
                content: "x".to_string(),
            };
            assert_eq!(doc.apply_remote(op).unwrap().status, ApplyStatus::Pending);
        }
        let overflow = Operation::Insert {
            id: ItemId::new(A, 30),
            origin_left: None,
            origin_right: None,
            content: "x".to_string(),
        };
        assert!(matches!(doc.apply_remote(overflow), Err(DocError::PendingOverflow(2))));
    }

    #[test]
    fn test_expire_pending_drops_stale_operations() {
        let mut doc = Document::new(B);
        let orphan = Operation::Insert {
            id: ItemId::new(A, 5),
            origin_left: None,
            origin_right: None,
            content: "late".to_string(),
        };
        doc.apply_remote(orphan).unwrap();
        assert!(doc.expire_pending(Duration::from_secs(60)).is_empty());
        assert_eq!(doc.expire_pending(Duration::ZERO), vec![ItemId::new(A, 5)]);
        assert_eq!(doc.pending_len(), 0);
    }

    #[test]
    fn test_encode_decode_state_preserves_history() {
        let mut a = Document::new(A);
        a.insert(0, "draft text").unwrap();
        a.delete(0, 6).unwrap();
        a.insert(4, "!").unwrap();

        let bytes = a.encode_state().unwrap();
        let restored = Document::decode_state(C, &bytes).unwrap();
        assert_eq!(restored.text(), a.text());
        assert_eq!(restored.state_vector(), a.state_vector());
        assert_eq!(restored.client_id(), C);

        // A peer that knew the pre-restart history merges cleanly.
        let mut b = Document::new(B);
        sync(&a, &mut b);
        let edit = b.insert(0, ">").unwrap();
        let mut restored = restored;
        restored.apply_remote(edit).unwrap();
        assert_eq!(restored.text(), ">text!");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            Document::decode_state(A, &[0xFF, 0x01, 0x02]),
            Err(DocError::Decode(_))
        ));
    }

    #[test]
    fn test_out_of_bounds_edits() {
        let mut doc = Document::from_text(A, "abc");
        assert_eq!(
            doc.insert(4, "x"),
            Err(DocError::OutOfBounds { position: 4, len: 3 })
        );
        assert!(doc.delete(2, 2).is_err());
        assert_eq!(doc.insert(0, ""), Err(DocError::EmptyInsert));
        assert!(doc.delete(1, 0).unwrap().is_empty());
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let mut a = Document::from_text(A, "héllo wörld");
        let mut b = Document::new(B);
        sync(&a, &mut b);
        a.delete(1, 1).unwrap();
        b.insert(8, "ö").unwrap();
        sync(&a, &mut b);
        sync(&b, &mut a);
        assert_eq!(a.text(), "hllo wöörld");
        assert_eq!(a.text(), b.text());
    }
}
