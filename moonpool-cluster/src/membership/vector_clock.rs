//! Vector clock versioning the gossip state.
//!
//! Each member that modifies the gossip bumps its own entry. Comparing two
//! clocks tells whether one gossip version descends from the other or whether
//! the two were modified concurrently and must be merged.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::UniqueAddress;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Identical clocks.
    Same,
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Neither descends from the other.
    Concurrent,
}

/// A vector clock keyed by the textual form of a [`UniqueAddress`].
///
/// Keys are strings so the clock serializes to any self-describing format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    versions: BTreeMap<String, u64>,
}

impl VectorClock {
    /// An empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the entry of `node`.
    pub fn increment(&mut self, node: &UniqueAddress) {
        *self.versions.entry(node.to_string()).or_insert(0) += 1;
    }

    /// Entry of `node`, zero when absent.
    pub fn get(&self, node: &UniqueAddress) -> u64 {
        self.versions.get(&node.to_string()).copied().unwrap_or(0)
    }

    /// Entry-wise maximum.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut versions = self.versions.clone();
        for (key, &value) in &other.versions {
            let entry = versions.entry(key.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
        VectorClock { versions }
    }

    /// Drop the entry of a removed member.
    pub fn prune(&mut self, node: &UniqueAddress) {
        self.versions.remove(&node.to_string());
    }

    /// Compare two clocks.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut ordering = Ordering::Equal;
        let keys = self.versions.keys().chain(other.versions.keys());
        for key in keys {
            let mine = self.versions.get(key).copied().unwrap_or(0);
            let theirs = other.versions.get(key).copied().unwrap_or(0);
            match (ordering, mine.cmp(&theirs)) {
                (_, Ordering::Equal) => {}
                (Ordering::Equal, cmp) => ordering = cmp,
                (current, cmp) if current != cmp => return ClockOrdering::Concurrent,
                _ => {}
            }
        }
        match ordering {
            Ordering::Equal => ClockOrdering::Same,
            Ordering::Less => ClockOrdering::Before,
            Ordering::Greater => ClockOrdering::After,
        }
    }
}
