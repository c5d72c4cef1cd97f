//! Shard allocation and rebalancing.
//!
//! The coordinator consults a [`ShardAllocationStrategy`] for two questions:
//! where should an unowned shard go, and which shards should move so that
//! ownership evens out. Both answers are pure functions of the current
//! ownership map.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use super::ShardId;
use crate::UniqueAddress;

/// Shards hosted by each hosting region, keyed by region node.
pub type Ownership = BTreeMap<UniqueAddress, Vec<ShardId>>;

/// Strategy deciding shard placement.
pub trait ShardAllocationStrategy {
    /// Region that should own `shard`, or `None` when no region can.
    fn allocate(
        &self,
        shard: &ShardId,
        ownership: &Ownership,
        leaving: &BTreeSet<UniqueAddress>,
    ) -> Option<UniqueAddress>;

    /// Shards to move, with their target region. `excluded` shards (in
    /// flight or blocked) never move; at most `budget` moves are returned.
    fn rebalance(
        &self,
        ownership: &Ownership,
        leaving: &BTreeSet<UniqueAddress>,
        excluded: &BTreeSet<ShardId>,
        budget: usize,
    ) -> Vec<(ShardId, UniqueAddress)>;
}

/// Keeps every region at `floor` or `ceil` of the average shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvenShardAllocation {
    rebalance_threshold: usize,
}

impl EvenShardAllocation {
    /// Create the strategy. Rebalancing starts once the spread between the
    /// fullest and emptiest region reaches `rebalance_threshold`.
    pub fn new(rebalance_threshold: usize) -> Self {
        Self {
            rebalance_threshold: rebalance_threshold.max(1),
        }
    }

    /// Target shard count per region. Leaving regions get zero; the regions
    /// already holding the most shards get the `ceil` quotas.
    pub fn quotas(
        ownership: &Ownership,
        leaving: &BTreeSet<UniqueAddress>,
    ) -> BTreeMap<UniqueAddress, usize> {
        let total: usize = ownership.values().map(Vec::len).sum();
        let mut active: Vec<(&UniqueAddress, usize)> = ownership
            .iter()
            .filter(|(region, _)| !leaving.contains(*region))
            .map(|(region, shards)| (region, shards.len()))
            .collect();

        let mut quotas: BTreeMap<UniqueAddress, usize> =
            ownership.keys().map(|r| (r.clone(), 0)).collect();
        if active.is_empty() {
            return quotas;
        }
        let base = total / active.len();
        let extra = total % active.len();
        active.sort_by_key(|(region, count)| (Reverse(*count), *region));
        for (i, (region, _)) in active.into_iter().enumerate() {
            quotas.insert(region.clone(), base + usize::from(i < extra));
        }
        quotas
    }
}

impl ShardAllocationStrategy for EvenShardAllocation {
    fn allocate(
        &self,
        _shard: &ShardId,
        ownership: &Ownership,
        leaving: &BTreeSet<UniqueAddress>,
    ) -> Option<UniqueAddress> {
        ownership
            .iter()
            .filter(|(region, _)| !leaving.contains(*region))
            .min_by_key(|(region, shards)| (shards.len(), *region))
            .map(|(region, _)| region.clone())
    }

    fn rebalance(
        &self,
        ownership: &Ownership,
        leaving: &BTreeSet<UniqueAddress>,
        excluded: &BTreeSet<ShardId>,
        budget: usize,
    ) -> Vec<(ShardId, UniqueAddress)> {
        if budget == 0 {
            return Vec::new();
        }
        let leaving_has_shards = ownership
            .iter()
            .any(|(region, shards)| leaving.contains(region) && !shards.is_empty());
        let active_counts = ownership
            .iter()
            .filter(|(region, _)| !leaving.contains(*region))
            .map(|(_, shards)| shards.len());
        let spread = match (active_counts.clone().max(), active_counts.min()) {
            (Some(max), Some(min)) => max - min,
            _ => return Vec::new(),
        };
        if !leaving_has_shards && spread < self.rebalance_threshold {
            return Vec::new();
        }

        let quotas = Self::quotas(ownership, leaving);
        let mut surplus: Vec<ShardId> = Vec::new();
        for (region, shards) in ownership {
            let quota = quotas.get(region).copied().unwrap_or(0);
            if shards.len() > quota {
                let mut sorted = shards.clone();
                sorted.sort();
                surplus.extend(
                    sorted
                        .into_iter()
                        .rev()
                        .filter(|s| !excluded.contains(s))
                        .take(shards.len() - quota),
                );
            }
        }

        let mut receivers: Vec<(UniqueAddress, usize)> = ownership
            .iter()
            .filter_map(|(region, shards)| {
                let quota = quotas.get(region).copied().unwrap_or(0);
                (quota > shards.len()).then(|| (region.clone(), quota - shards.len()))
            })
            .collect();
        receivers.sort_by_key(|(region, _)| {
            (ownership.get(region).map_or(0, Vec::len), region.clone())
        });

        let mut moves = Vec::new();
        let mut receivers = receivers.into_iter();
        let mut current = receivers.next();
        for shard in surplus {
            if moves.len() >= budget {
                break;
            }
            while current.as_ref().is_some_and(|(_, room)| *room == 0) {
                current = receivers.next();
            }
            let Some((region, room)) = current.as_mut() else {
                break;
            };
            moves.push((shard, region.clone()));
            *room -= 1;
        }
        moves
    }
}
