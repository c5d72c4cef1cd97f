//! The event-loop contract shared by every cluster component.
//!
//! Components are plain state machines. A driver feeds them one [`Input`] at
//! a time together with the current time, and the component answers by
//! pushing [`Effect`]s into an [`Outbox`]. Components never touch a socket,
//! a clock or another component directly, which is what lets the same code
//! run under the Tokio runtime ([`ClusterNode`](crate::ClusterNode)) and
//! under the deterministic [`SimCluster`](crate::sim::SimCluster).
//!
//! ```text
//!            ┌──────────────┐
//!  Input ──▶ │  Component   │ ──▶ Outbox: Send / Local / Event / Complete
//!            └──────────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::events::ClusterEvent;
use crate::membership::ClusterState;
use crate::protocol::{ClusterMessage, EntityEnvelope, RouteOutcome, SingletonEnvelope};
use crate::sharding::ShardTable;
use crate::{NodeAddress, UniqueAddress};

/// Identifies a component within a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentId {
    /// Membership service (gossip, failure detector, leader actions).
    Membership,
    /// Split-brain resolver.
    Resolver,
    /// Message router.
    Router,
    /// Shard coordinator for an entity type.
    Coordinator(String),
    /// Shard region for an entity type.
    Region(String),
    /// Singleton manager for a singleton name.
    SingletonManager(String),
    /// Singleton proxy for a singleton name.
    SingletonProxy(String),
    /// Host of a user singleton instance.
    SingletonHost(String),
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Membership => write!(f, "membership"),
            Self::Resolver => write!(f, "resolver"),
            Self::Router => write!(f, "router"),
            Self::Coordinator(t) => write!(f, "coordinator/{t}"),
            Self::Region(t) => write!(f, "region/{t}"),
            Self::SingletonManager(n) => write!(f, "singleton-manager/{n}"),
            Self::SingletonProxy(n) => write!(f, "singleton-proxy/{n}"),
            Self::SingletonHost(n) => write!(f, "singleton-host/{n}"),
        }
    }
}

/// Logical destination of a routed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// A sharded entity.
    Entity {
        /// Entity type.
        type_name: String,
        /// Entity id; the shard is derived from it.
        entity_id: String,
    },
    /// A cluster singleton.
    Singleton {
        /// Singleton name.
        name: String,
    },
}

impl Target {
    /// Target a sharded entity.
    pub fn entity(type_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::Entity {
            type_name: type_name.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Target a singleton.
    pub fn singleton(name: impl Into<String>) -> Self {
        Self::Singleton { name: name.into() }
    }
}

/// Messages between components of the same node.
#[derive(Debug, Clone)]
pub enum LocalEvent {
    /// Membership published a new snapshot.
    MembershipChanged(Arc<ClusterState>),
    /// Resolver decided to down these members.
    DownMembers(Vec<UniqueAddress>),
    /// The application asked this node to leave the cluster.
    Leave,
    /// A participant finished handing off what it hosted on this leaving node.
    Drained(ComponentId),
    /// Manager → instance: start hosting `generation`.
    InstanceStart {
        /// Singleton name.
        name: String,
        /// Generation to host.
        generation: u64,
    },
    /// Manager → instance: stop.
    InstanceStop {
        /// Singleton name.
        name: String,
    },
    /// Instance → manager: stopped.
    InstanceStopped {
        /// Singleton name.
        name: String,
    },
    /// Manager → instance: application message.
    InstanceDeliver {
        /// Singleton name.
        name: String,
        /// The message.
        envelope: SingletonEnvelope,
    },
    /// Router → region: application message.
    RegionDeliver {
        /// Entity type.
        type_name: String,
        /// The message.
        envelope: EntityEnvelope,
    },
    /// Router → proxy: application message.
    ProxyDeliver {
        /// Singleton name.
        name: String,
        /// The message.
        envelope: SingletonEnvelope,
    },
    /// Driver → router: route a request.
    Ask {
        /// Request id allocated by the driver.
        request_id: u64,
        /// Destination.
        target: Target,
        /// Opaque payload.
        payload: Vec<u8>,
        /// Whether a reply is awaited.
        expects_reply: bool,
    },
    /// Coordinator published its shard table.
    ShardTableChanged(Arc<ShardTable>),
    /// Proxy learned a new singleton host (or lost it).
    SingletonHostChanged {
        /// Singleton name.
        name: String,
        /// Current host, if known.
        host: Option<UniqueAddress>,
    },
}

/// One unit of work for a component.
#[derive(Debug, Clone)]
pub enum Input {
    /// A message from another node (or this node, looped back).
    Remote {
        /// Sender.
        from: UniqueAddress,
        /// Message.
        message: ClusterMessage,
    },
    /// A message from another component of this node.
    Local(LocalEvent),
    /// Periodic timer tick.
    Tick,
}

/// Something a component wants the driver to do.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a message to a node. Sends to this node's own address loop back.
    Send {
        /// Destination.
        to: NodeAddress,
        /// Message.
        message: ClusterMessage,
    },
    /// Hand an event to the components of this node that consume it.
    Local(LocalEvent),
    /// Publish an observability event.
    Event(ClusterEvent),
    /// Resolve a pending request of this node's router.
    Complete {
        /// Request id.
        request_id: u64,
        /// Result.
        outcome: RouteOutcome,
    },
}

/// Effects produced while handling one input.
#[derive(Debug, Default)]
pub struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    /// An empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a message to `to`.
    pub fn send(&mut self, to: &UniqueAddress, message: ClusterMessage) {
        self.send_to(to.address().clone(), message);
    }

    /// Send a message to a bare address (seed nodes).
    pub fn send_to(&mut self, to: NodeAddress, message: ClusterMessage) {
        self.effects.push(Effect::Send { to, message });
    }

    /// Emit a local event.
    pub fn local(&mut self, event: LocalEvent) {
        self.effects.push(Effect::Local(event));
    }

    /// Publish an observability event.
    pub fn event(&mut self, event: ClusterEvent) {
        self.effects.push(Effect::Event(event));
    }

    /// Resolve a router request.
    pub fn complete(&mut self, request_id: u64, outcome: RouteOutcome) {
        self.effects.push(Effect::Complete {
            request_id,
            outcome,
        });
    }

    /// Take the accumulated effects.
    pub fn drain(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Accumulated effects, for inspection in tests.
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }
}

/// A single-threaded event loop of the cluster core.
pub trait Component {
    /// Identity used for routing.
    fn id(&self) -> ComponentId;

    /// Process one input at time `now`.
    fn handle(&mut self, now: Duration, input: Input, out: &mut Outbox);
}
