use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{ClientId, ItemId};

/// Summary of what a replica has observed: client → next expected clock.
///
/// Because operations from one client are integrated strictly in clock
/// order, "next expected clock" is also the number of clock units seen.
/// An empty vector means "nothing observed" and is what a fresh peer sends
/// to ask for everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ClientId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected clock for `client` (0 if never seen).
    pub fn get(&self, client: ClientId) -> u64 {
        self.clocks.get(&client).copied().unwrap_or(0)
    }

    /// Whether the clock unit `id` has been observed.
    pub fn contains(&self, id: ItemId) -> bool {
        id.clock < self.get(id.client)
    }

    /// Raise the entry for `client` to at least `next`.
    pub fn advance(&mut self, client: ClientId, next: u64) {
        let entry = self.clocks.entry(client).or_insert(0);
        if next > *entry {
            *entry = next;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.clocks.iter().map(|(c, n)| (*c, *n))
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// True if every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.iter().all(|(client, next)| self.get(client) >= next)
    }
}

impl FromIterator<(ClientId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ClientId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (client, next) in iter {
            sv.advance(client, next);
        }
        sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_vector_observes_nothing() {
        let sv = StateVector::new();
        assert!(sv.is_empty());
        assert_eq!(sv.get(ClientId(1)), 0);
        assert!(!sv.contains(ItemId::new(ClientId(1), 0)));
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let mut sv = StateVector::new();
        sv.advance(ClientId(1), 5);
        sv.advance(ClientId(1), 3);
        assert_eq!(sv.get(ClientId(1)), 5);
        assert!(sv.contains(ItemId::new(ClientId(1), 4)));
        assert!(!sv.contains(ItemId::new(ClientId(1), 5)));
    }

    #[test]
    fn test_dominates() {
        let a: StateVector = [(ClientId(1), 4), (ClientId(2), 2)].into_iter().collect();
        let b: StateVector = [(ClientId(1), 3)].into_iter().collect();
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(a.dominates(&StateVector::new()));
    }
}
