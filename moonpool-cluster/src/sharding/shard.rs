//! Shard identifiers and the entity → shard mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a shard, unique within one entity type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub String);

impl ShardId {
    /// Create a shard id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for ShardId {
    fn from(n: u32) -> Self {
        Self(n.to_string())
    }
}

/// Maps an entity id to its shard.
///
/// Must be a pure function: every node computes the same shard for the same
/// entity id, or messages for one entity would be split across owners.
pub trait ShardExtractor {
    /// Shard of `entity_id`.
    fn shard_id(&self, entity_id: &str) -> ShardId;
}

/// Hash-based extractor: `crc32c(entity_id) mod number_of_shards`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashExtractor {
    number_of_shards: u32,
}

impl HashExtractor {
    /// Create an extractor. A zero shard count is treated as one.
    pub fn new(number_of_shards: u32) -> Self {
        Self {
            number_of_shards: number_of_shards.max(1),
        }
    }

    /// Every shard this extractor can produce.
    pub fn all_shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.number_of_shards).map(ShardId::from)
    }
}

impl ShardExtractor for HashExtractor {
    fn shard_id(&self, entity_id: &str) -> ShardId {
        ShardId::from(crc32c::crc32c(entity_id.as_bytes()) % self.number_of_shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_extractor_is_stable_and_bounded() {
        let extractor = HashExtractor::new(10);
        for i in 0..200 {
            let id = format!("entity-{i}");
            let shard = extractor.shard_id(&id);
            assert_eq!(shard, HashExtractor::new(10).shard_id(&id));
            let n: u32 = shard.as_str().parse().expect("numeric shard");
            assert!(n < 10);
        }
    }

    #[test]
    fn test_hash_extractor_spreads_entities() {
        let extractor = HashExtractor::new(4);
        let used: std::collections::BTreeSet<ShardId> = (0..100)
            .map(|i| extractor.shard_id(&format!("user-{i}")))
            .collect();
        assert_eq!(used.len(), 4);
        assert_eq!(extractor.all_shards().count(), 4);
    }

    #[test]
    fn test_shard_id_serializes_as_string() {
        let json = serde_json::to_string(&ShardId::from(7)).expect("serialize");
        assert_eq!(json, "\"7\"");
    }
}
