//! Presence (awareness) for real-time "who's here and where" metadata.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! AwarenessTable::set_local()      clock += 1, state replaced wholesale
//!       │
//!       ▼
//! SyncMessage::Presence { client, clock, json | None }
//!       │
//!       ▼   (room broadcast, no debouncing)
//! AwarenessTable::apply_remote()   newer clock wins, None = removal
//!       │
//!       ▼
//! AwarenessChange { added, updated, removed }
//! ```
//!
//! Entries are never merged field by field. Each update carries a per-client
//! clock and replaces the whole state; removals are tracked so a stale state
//! cannot resurrect a departed client. Presence is independent of document
//! content and never persisted.
//!
//! Reference: Kleppmann, Chapter 8, Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tandem_core::ClientId;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Identity of one connection (session) on the server.
pub type SessionId = Uuid;

// ───────────────────────────────────────────────────────────────────
// Presence state
// ───────────────────────────────────────────────────────────────────

/// Selection or caret, as char offsets into the document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: usize,
    pub head: usize,
}

/// Presence metadata a user publishes. Carried on the wire as JSON so editors
/// can attach their own fields (collected in `extra`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserPresence {
    /// Presence with a stable color derived from `client`.
    pub fn new(client: ClientId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: presence_color(client),
            cursor: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_cursor(mut self, anchor: usize, head: usize) -> Self {
        self.cursor = Some(CursorRange { anchor, head });
        self
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidPresence(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::InvalidPresence(e.to_string()))
    }
}

/// Stable, visually distinct `#rrggbb` color for a client.
pub fn presence_color(client: ClientId) -> String {
    // Golden-ratio hue spacing keeps consecutive ids apart.
    let hue = (client.0 as f64 * 0.618_033_988_749_895).fract() as f32;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// One entry of a presence message. `state: None` removes the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntryUpdate {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntryUpdate>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Client ids affected by an applied update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Table
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct EntryMeta {
    clock: u64,
    updated_at: Instant,
}

/// A live presence entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: UserPresence,
}

/// Per-room map of client id → presence.
#[derive(Debug, Default)]
pub struct AwarenessTable {
    states: HashMap<ClientId, UserPresence>,
    /// Clocks survive removal so late updates cannot resurrect an entry.
    meta: HashMap<ClientId, EntryMeta>,
    /// Session that introduced each live client id.
    controllers: HashMap<ClientId, SessionId>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, client: ClientId) -> Option<&UserPresence> {
        self.states.get(&client)
    }

    pub fn clock(&self, client: ClientId) -> u64 {
        self.meta.get(&client).map_or(0, |m| m.clock)
    }

    /// When the client's entry last changed.
    pub fn last_updated(&self, client: ClientId) -> Option<Instant> {
        self.meta.get(&client).map(|m| m.updated_at)
    }

    /// Publish this replica's own presence. Returns the update to send.
    pub fn set_local(
        &mut self,
        client: ClientId,
        presence: UserPresence,
    ) -> Result<AwarenessUpdate, ProtocolError> {
        let json = presence.to_json()?;
        let clock = self.clock(client) + 1;
        self.states.insert(client, presence);
        self.touch(client, clock);
        Ok(AwarenessUpdate {
            entries: vec![AwarenessEntryUpdate {
                client_id: client,
                clock,
                state: Some(json),
            }],
        })
    }

    /// Apply an update received from `origin` (None for updates relayed by
    /// the server to a client). Returns what changed and the subset of the
    /// update that was accepted, suitable for relaying.
    pub fn apply_remote(
        &mut self,
        update: &AwarenessUpdate,
        origin: Option<SessionId>,
    ) -> (AwarenessChange, AwarenessUpdate) {
        let mut change = AwarenessChange::default();
        let mut accepted = AwarenessUpdate::default();

        for entry in &update.entries {
            let current = self.clock(entry.client_id);
            let live = self.states.contains_key(&entry.client_id);
            let newer = entry.clock > current || (entry.clock == current && entry.state.is_none() && live);
            if !newer {
                continue;
            }

            match &entry.state {
                Some(json) => {
                    let presence = match UserPresence::from_json(json) {
                        Ok(p) => p,
                        Err(e) => {
                            log::warn!("dropping presence for client {}: {e}", entry.client_id);
                            continue;
                        }
                    };
                    match self.states.insert(entry.client_id, presence.clone()) {
                        None => change.added.push(entry.client_id),
                        Some(previous) if previous != presence => change.updated.push(entry.client_id),
                        Some(_) => {}
                    }
                    if let Some(session) = origin {
                        self.controllers.entry(entry.client_id).or_insert(session);
                    }
                }
                None => {
                    if self.states.remove(&entry.client_id).is_some() {
                        change.removed.push(entry.client_id);
                    }
                    self.controllers.remove(&entry.client_id);
                }
            }
            self.touch(entry.client_id, entry.clock);
            accepted.entries.push(entry.clone());
        }
        (change, accepted)
    }

    /// Remove entries explicitly. Returns the removal update to broadcast
    /// (empty if none of the ids were present).
    pub fn remove(&mut self, clients: &[ClientId]) -> AwarenessUpdate {
        let mut update = AwarenessUpdate::default();
        for client in clients {
            if self.states.remove(client).is_none() {
                continue;
            }
            self.controllers.remove(client);
            let clock = self.clock(*client) + 1;
            self.touch(*client, clock);
            update.entries.push(AwarenessEntryUpdate {
                client_id: *client,
                clock,
                state: None,
            });
        }
        update
    }

    /// Client ids introduced by `session`.
    pub fn controlled_by(&self, session: SessionId) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .controllers
            .iter()
            .filter(|(_, s)| **s == session)
            .map(|(c, _)| *c)
            .collect();
        ids.sort();
        ids
    }

    /// Remove everything `session` controlled.
    pub fn remove_session(&mut self, session: SessionId) -> AwarenessUpdate {
        let ids = self.controlled_by(session);
        self.remove(&ids)
    }

    /// Forget every client except `keep`, clocks included. Returns the live
    /// ids that were dropped. Used by a client that lost its connection: the
    /// next snapshot from the server is authoritative for everyone else.
    pub fn reset_remote(&mut self, keep: ClientId) -> Vec<ClientId> {
        let mut dropped: Vec<ClientId> = self.states.keys().copied().filter(|c| *c != keep).collect();
        dropped.sort();
        self.states.retain(|c, _| *c == keep);
        self.meta.retain(|c, _| *c == keep);
        self.controllers.retain(|c, _| *c == keep);
        dropped
    }

    /// All live entries, ordered by client id.
    pub fn snapshot(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<AwarenessEntry> = self
            .states
            .iter()
            .map(|(client, state)| AwarenessEntry {
                client_id: *client,
                clock: self.clock(*client),
                state: state.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        entries
    }

    /// Full state as an update, for a newly joined peer.
    pub fn encode_full(&self) -> AwarenessUpdate {
        let mut update = AwarenessUpdate::default();
        for entry in self.snapshot() {
            match entry.state.to_json() {
                Ok(json) => update.entries.push(AwarenessEntryUpdate {
                    client_id: entry.client_id,
                    clock: entry.clock,
                    state: Some(json),
                }),
                Err(e) => log::warn!("skipping presence for client {}: {e}", entry.client_id),
            }
        }
        update
    }

    /// Live client ids.
    pub fn clients(&self) -> HashSet<ClientId> {
        self.states.keys().copied().collect()
    }

    fn touch(&mut self, client: ClientId, clock: u64) {
        self.meta.insert(
            client,
            EntryMeta {
                clock,
                updated_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(client: u64, clock: u64, name: Option<&str>) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntryUpdate {
                client_id: ClientId(client),
                clock,
                state: name.map(|n| UserPresence::new(ClientId(client), n).to_json().unwrap()),
            }],
        }
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_presence_color_is_stable_hex() {
        let a = presence_color(ClientId(42));
        assert_eq!(a, presence_color(ClientId(42)));
        assert_eq!(a.len(), 7);
        assert!(a.starts_with('#'));
        assert_ne!(a, presence_color(ClientId(43)));
    }

    #[test]
    fn test_presence_json_keeps_extra_fields() {
        let json = r##"{"name":"Ana","color":"#ff0000","cursor":{"anchor":1,"head":4},"tool":"pen"}"##;
        let presence = UserPresence::from_json(json).unwrap();
        assert_eq!(presence.cursor, Some(CursorRange { anchor: 1, head: 4 }));
        assert_eq!(presence.extra.get("tool"), Some(&serde_json::json!("pen")));
        let again = UserPresence::from_json(&presence.to_json().unwrap()).unwrap();
        assert_eq!(again, presence);
    }

    #[test]
    fn test_set_local_bumps_clock() {
        let mut table = AwarenessTable::new();
        let first = table.set_local(ClientId(1), UserPresence::new(ClientId(1), "me")).unwrap();
        let second = table
            .set_local(ClientId(1), UserPresence::new(ClientId(1), "me").with_cursor(3, 3))
            .unwrap();
        assert_eq!(first.entries[0].clock, 1);
        assert_eq!(second.entries[0].clock, 2);
        assert_eq!(table.len(), 1);
        assert!(table.last_updated(ClientId(1)).is_some());
    }

    #[test]
    fn test_apply_remote_reports_added_updated_removed() {
        let mut table = AwarenessTable::new();
        let (change, accepted) = table.apply_remote(&remote(5, 1, Some("Ana")), None);
        assert_eq!(change.added, vec![ClientId(5)]);
        assert_eq!(accepted.entries.len(), 1);

        let (change, _) = table.apply_remote(&remote(5, 2, Some("Ana B")), None);
        assert_eq!(change.updated, vec![ClientId(5)]);

        let (change, _) = table.apply_remote(&remote(5, 3, None), None);
        assert_eq!(change.removed, vec![ClientId(5)]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_update_is_ignored() {
        let mut table = AwarenessTable::new();
        table.apply_remote(&remote(5, 4, Some("new")), None);
        let (change, accepted) = table.apply_remote(&remote(5, 3, Some("old")), None);
        assert!(change.is_empty());
        assert!(accepted.is_empty());
        assert_eq!(table.get(ClientId(5)).unwrap().name, "new");
    }

    #[test]
    fn test_removed_client_is_not_resurrected_by_late_state() {
        let mut table = AwarenessTable::new();
        table.apply_remote(&remote(5, 1, Some("Ana")), None);
        table.remove(&[ClientId(5)]);
        let (change, _) = table.apply_remote(&remote(5, 2, Some("Ana")), None);
        assert!(change.is_empty());
        assert!(table.get(ClientId(5)).is_none());
    }

    #[test]
    fn test_invalid_json_is_dropped() {
        let mut table = AwarenessTable::new();
        let update = AwarenessUpdate {
            entries: vec![AwarenessEntryUpdate {
                client_id: ClientId(1),
                clock: 1,
                state: Some("not json".to_string()),
            }],
        };
        let (change, accepted) = table.apply_remote(&update, None);
        assert!(change.is_empty());
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_remove_session_clears_only_its_entries() {
        let mut table = AwarenessTable::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        table.apply_remote(&remote(1, 1, Some("Alice")), Some(alice));
        table.apply_remote(&remote(2, 1, Some("Alice tab 2")), Some(alice));
        table.apply_remote(&remote(3, 1, Some("Bob")), Some(bob));

        assert_eq!(table.controlled_by(alice), vec![ClientId(1), ClientId(2)]);
        let removal = table.remove_session(alice);
        assert_eq!(removal.entries.len(), 2);
        assert!(removal.entries.iter().all(|e| e.state.is_none() && e.clock == 2));

        let remaining: Vec<ClientId> = table.snapshot().into_iter().map(|e| e.client_id).collect();
        assert_eq!(remaining, vec![ClientId(3)]);
        assert!(table.remove_session(alice).is_empty());
    }

    #[test]
    fn test_reset_remote_keeps_own_clock() {
        let mut table = AwarenessTable::new();
        let me = ClientId(9);
        table.set_local(me, UserPresence::new(me, "Me")).unwrap();
        table.apply_remote(&remote(1, 4, Some("Alice")), None);

        assert_eq!(table.reset_remote(me), vec![ClientId(1)]);
        assert_eq!(table.clients(), HashSet::from([me]));
        assert_eq!(table.clock(me), 1);
        // Alice's old clock is forgotten, so a fresh snapshot at a lower
        // clock is accepted.
        let (change, _) = table.apply_remote(&remote(1, 2, Some("Alice")), None);
        assert_eq!(change.added, vec![ClientId(1)]);
    }

    #[test]
    fn test_encode_full_replays_into_empty_table() {
        let mut table = AwarenessTable::new();
        table.apply_remote(&remote(1, 7, Some("Alice")), None);
        table.apply_remote(&remote(2, 2, Some("Bob")), None);

        let mut fresh = AwarenessTable::new();
        let (change, _) = fresh.apply_remote(&table.encode_full(), None);
        assert_eq!(change.added.len(), 2);
        assert_eq!(fresh.snapshot(), table.snapshot());
    }
}
