//! Cluster sharding.
//!
//! Entities of one type are spread over the cluster in a fixed number of
//! shards. The [`ShardCoordinator`] (a cluster singleton per type) owns the
//! shard → region table; every node runs a [`ShardRegion`] that hosts the
//! shards allocated to it and routes the rest.

pub mod allocation;
pub mod coordinator;
pub mod entity;
pub mod region;
pub mod shard;
pub mod table;

pub use allocation::{EvenShardAllocation, Ownership, ShardAllocationStrategy};
pub use coordinator::ShardCoordinator;
pub use entity::{Entity, EntityContext, EntityFactory};
pub use region::{ShardRegion, MAX_HOPS};
pub use shard::{HashExtractor, ShardExtractor, ShardId};
pub use table::{HandoffInProgress, ShardTable};

/// Singleton name under which the coordinator of `type_name` runs.
pub fn coordinator_singleton_name(type_name: &str) -> String {
    format!("{type_name}-coordinator")
}
