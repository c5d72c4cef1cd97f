//! Observability events.
//!
//! Components publish [`ClusterEvent`]s for every lifecycle transition that
//! matters to an operator or a test oracle. The runtime broadcasts them to
//! subscribers; the simulation appends them, time-stamped, to its event log,
//! which is what the exclusivity and uniqueness checks read.

use serde::{Deserialize, Serialize};

use crate::downing::Decision;
use crate::membership::MemberStatus;
use crate::protocol::MessageId;
use crate::sharding::ShardId;
use crate::UniqueAddress;

/// A lifecycle event observed on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A member's status changed in this node's view.
    MemberStatusChanged {
        /// Member.
        node: UniqueAddress,
        /// New status.
        status: MemberStatus,
    },
    /// A member was removed from this node's view.
    MemberRemoved {
        /// Member.
        node: UniqueAddress,
    },
    /// The leader changed in this node's view.
    LeaderChanged {
        /// New leader.
        leader: Option<UniqueAddress>,
    },
    /// A member became unreachable in this node's view.
    Unreachable {
        /// Member.
        node: UniqueAddress,
    },
    /// A member became reachable again in this node's view.
    Reachable {
        /// Member.
        node: UniqueAddress,
    },
    /// The resolver on this node took a decision.
    DownDecision {
        /// The decision.
        decision: Decision,
        /// Members the decision downs.
        downed: Vec<UniqueAddress>,
    },
    /// This node learned it has been downed.
    SelfDowned,
    /// This node learned it has been removed.
    SelfRemoved,
    /// This node started hosting a singleton generation.
    SingletonStarted {
        /// Singleton name.
        name: String,
        /// Generation.
        generation: u64,
    },
    /// This node stopped hosting a singleton generation.
    SingletonStopped {
        /// Singleton name.
        name: String,
        /// Generation.
        generation: u64,
    },
    /// An entity instance was created on this node.
    EntityStarted {
        /// Entity type.
        type_name: String,
        /// Entity id.
        entity_id: String,
    },
    /// An entity instance on this node was stopped.
    EntityPassivated {
        /// Entity type.
        type_name: String,
        /// Entity id.
        entity_id: String,
    },
    /// An entity on this node processed a message.
    MessageProcessed {
        /// Entity type.
        type_name: String,
        /// Entity id.
        entity_id: String,
        /// Message identity.
        id: MessageId,
    },
    /// The coordinator on this node allocated a shard.
    ShardAllocated {
        /// Entity type.
        type_name: String,
        /// Shard.
        shard: ShardId,
        /// Owner.
        region: UniqueAddress,
    },
    /// The coordinator on this node started a handoff.
    HandoffStarted {
        /// Entity type.
        type_name: String,
        /// Shard.
        shard: ShardId,
        /// Current owner.
        from: UniqueAddress,
        /// Intended owner.
        to: UniqueAddress,
    },
    /// The coordinator on this node completed a handoff.
    HandoffCompleted {
        /// Entity type.
        type_name: String,
        /// Shard.
        shard: ShardId,
        /// New owner.
        to: UniqueAddress,
    },
    /// A handoff exhausted its retries; the shard is blocked.
    HandoffFailed {
        /// Entity type.
        type_name: String,
        /// Shard.
        shard: ShardId,
        /// Owner the shard stays with.
        from: UniqueAddress,
    },
    /// The node stopped (crash, self-down, removal or shutdown).
    NodeStopped,
}
