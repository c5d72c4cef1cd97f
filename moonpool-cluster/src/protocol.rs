//! Cross-node protocol messages.
//!
//! Every message exchanged between nodes is a variant of the closed
//! [`ClusterMessage`] union, one sub-enum per protocol. The receiving node
//! dispatches on the variant with a plain `match` (see
//! [`Wiring::remote_targets`](crate::wiring::Wiring::remote_targets)).
//!
//! All types derive `Serialize`/`Deserialize`; choosing a wire format is up to
//! the hosting transport.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::membership::{Gossip, VectorClock};
use crate::sharding::ShardId;
use crate::{NodeAddress, UniqueAddress};

/// A message in flight between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node.
    pub from: UniqueAddress,
    /// Destination address.
    pub to: NodeAddress,
    /// Payload.
    pub message: ClusterMessage,
}

/// Top-level protocol union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// Join, gossip and heartbeat traffic.
    Membership(MembershipMessage),
    /// Coordinator and region traffic for one entity type.
    Sharding {
        /// Entity type the message belongs to.
        type_name: String,
        /// The message.
        message: ShardingMessage,
    },
    /// Manager and proxy traffic for one singleton.
    Singleton {
        /// Singleton name.
        name: String,
        /// The message.
        message: SingletonMessage,
    },
    /// Reply to a routed request, addressed to the originating router.
    Reply {
        /// Node that issued the request.
        to: UniqueAddress,
        /// Request id assigned by the originating router.
        request_id: u64,
        /// Result.
        outcome: RouteOutcome,
    },
}

/// Membership protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MembershipMessage {
    /// Ask a seed to be admitted.
    Join {
        /// Roles of the joining node.
        roles: BTreeSet<String>,
    },
    /// A seed admitted the sender of a `Join`.
    Welcome {
        /// The seed's gossip, already containing the joiner.
        gossip: Gossip,
    },
    /// Full gossip state.
    Gossip {
        /// Intended recipient incarnation.
        to: UniqueAddress,
        /// The gossip.
        gossip: Gossip,
    },
    /// Version-only digest, sent when the peer already saw our version.
    GossipStatus {
        /// Intended recipient incarnation.
        to: UniqueAddress,
        /// Sender's gossip version.
        version: VectorClock,
    },
    /// Failure-detector heartbeat.
    Heartbeat {
        /// Intended recipient incarnation.
        to: UniqueAddress,
        /// Sequence number of this round.
        sequence: u64,
    },
    /// Heartbeat response.
    HeartbeatRsp {
        /// Sequence number being acknowledged.
        sequence: u64,
    },
}

/// Identity of a routed request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    /// Node whose router issued the request.
    pub origin: UniqueAddress,
    /// Request id, unique per origin.
    pub request_id: u64,
}

/// Application message for a sharded entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEnvelope {
    /// Target entity.
    pub entity_id: String,
    /// Shard of the entity.
    pub shard: ShardId,
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Request identity.
    pub id: MessageId,
    /// Whether the origin waits for a reply.
    pub expects_reply: bool,
    /// Number of region-to-region forwards so far.
    pub hops: u8,
}

/// Sharding protocol between regions and the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardingMessage {
    /// Region → coordinator: announce the region and the shards it hosts.
    Register {
        /// Shards currently hosted.
        shards: Vec<ShardId>,
        /// False for proxy-only regions.
        hosting: bool,
    },
    /// Coordinator → region: registration accepted.
    RegisterAck,
    /// Region → coordinator: where does this shard live?
    GetShardHome {
        /// Requested shard.
        shard: ShardId,
    },
    /// Coordinator → region: the shard lives at `region`.
    ShardHome {
        /// Shard.
        shard: ShardId,
        /// Owning region's node.
        region: UniqueAddress,
    },
    /// Coordinator → every region: forget the home of `shard` and buffer.
    BeginHandOff {
        /// Shard being moved.
        shard: ShardId,
    },
    /// Region → coordinator: `BeginHandOff` processed.
    BeginHandOffAck {
        /// Shard being moved.
        shard: ShardId,
    },
    /// Coordinator → source region: stop every entity of `shard`.
    HandOff {
        /// Shard being moved.
        shard: ShardId,
    },
    /// Source region → coordinator: all entities of `shard` are stopped.
    ShardStopped {
        /// Shard being moved.
        shard: ShardId,
    },
    /// Region → region: application message forwarded to the owner.
    Deliver(EntityEnvelope),
}

impl ShardingMessage {
    /// Whether the coordinator (rather than a region) consumes the message.
    pub fn is_for_coordinator(&self) -> bool {
        matches!(
            self,
            Self::Register { .. }
                | Self::GetShardHome { .. }
                | Self::BeginHandOffAck { .. }
                | Self::ShardStopped { .. }
        )
    }
}

/// Application message for a singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingletonEnvelope {
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Request identity.
    pub id: MessageId,
    /// Whether the origin waits for a reply.
    pub expects_reply: bool,
}

/// Singleton handover and proxy protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SingletonMessage {
    /// New oldest → previous host: stop and hand over.
    HandOverToMe,
    /// Previous host → new oldest: stopping, wait for `HandOverDone`.
    HandOverInProgress,
    /// Previous host → new oldest: stopped; start `generation + 1`.
    HandOverDone {
        /// Last generation the sender knows of.
        generation: u64,
    },
    /// Leaving host → successor: please request the handover now.
    TakeOverFromMe,
    /// Host → every member: the sender hosts `generation`.
    Announce {
        /// Hosted generation.
        generation: u64,
    },
    /// Proxy → candidate host: do you host the singleton?
    Identify,
    /// Reply to `Identify`.
    Identity {
        /// Hosted generation, `None` when the sender does not host it.
        generation: Option<u64>,
    },
    /// Proxy → host: application message.
    Deliver(SingletonEnvelope),
    /// Non-host → proxy: message sent to the wrong node.
    Bounced(SingletonEnvelope),
}

impl SingletonMessage {
    /// Whether the proxy (rather than the manager) consumes the message.
    pub fn is_for_proxy(&self) -> bool {
        matches!(
            self,
            Self::Announce { .. } | Self::Identity { .. } | Self::Bounced(_)
        )
    }

    /// Whether the manager consumes the message.
    pub fn is_for_manager(&self) -> bool {
        !matches!(self, Self::Identity { .. } | Self::Bounced(_))
    }
}

/// Result of a routed request as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOutcome {
    /// The target processed the message and replied.
    Success(Vec<u8>),
    /// No reply within the ask timeout.
    Timeout,
    /// The target has no resolvable owner or rejected the message.
    Unavailable,
}
