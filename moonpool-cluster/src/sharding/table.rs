//! Published shard ownership snapshot.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ShardId;
use crate::UniqueAddress;

/// A handoff in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffInProgress {
    /// Current owner.
    pub from: UniqueAddress,
    /// Intended owner.
    pub to: UniqueAddress,
}

/// Shard table of one entity type, as known by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTable {
    /// Entity type.
    pub type_name: String,
    /// Node running the coordinator that published the table.
    pub coordinator: UniqueAddress,
    /// Coordinator generation.
    pub generation: u64,
    /// Whether the coordinator was still active when publishing.
    pub active: bool,
    /// Owner of every allocated shard.
    pub shards: BTreeMap<ShardId, UniqueAddress>,
    /// Handoffs in flight.
    pub handoffs: BTreeMap<ShardId, HandoffInProgress>,
    /// Shards pinned to their owner after a failed handoff.
    pub blocked: BTreeSet<ShardId>,
}

impl ShardTable {
    /// Owner of `shard`.
    pub fn owner(&self, shard: &ShardId) -> Option<&UniqueAddress> {
        self.shards.get(shard)
    }

    /// Shards owned by `region`.
    pub fn shards_of(&self, region: &UniqueAddress) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|(_, owner)| *owner == region)
            .map(|(shard, _)| shard.clone())
            .collect()
    }

    /// Shard count per owner.
    pub fn counts(&self) -> BTreeMap<UniqueAddress, usize> {
        let mut counts = BTreeMap::new();
        for owner in self.shards.values() {
            *counts.entry(owner.clone()).or_insert(0) += 1;
        }
        counts
    }
}
