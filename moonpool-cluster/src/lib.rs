//! # moonpool-cluster
//!
//! Coordination core of a distributed actor cluster: who is in the cluster,
//! who is reachable, who leads, where every sharded entity lives, which node
//! runs each singleton, and how a partitioned cluster decides which side
//! survives.
//!
//! ## Components
//!
//! Each concern is a single-threaded state machine implementing
//! [`Component`](component::Component):
//!
//! - [`membership`]: gossip with vector clocks, phi-accrual failure
//!   detection, member lifecycle and leader actions
//! - [`downing`]: split-brain resolver and its strategies
//! - [`sharding`]: shard coordinator, shard region, entity hosting
//! - [`singleton`]: singleton manager, proxy and user singleton host
//! - [`router`]: request routing with ask timeouts
//!
//! Components exchange [`ClusterMessage`](protocol::ClusterMessage)s across
//! nodes and [`LocalEvent`](component::LocalEvent)s within a node. Which
//! component consumes what is decided by the [`wiring`].
//!
//! ## Drivers
//!
//! - [`ClusterNode`]: Tokio runtime, one local task per component, with a
//!   pluggable [`Transport`](transport::Transport)
//! - [`SimCluster`](sim::SimCluster): deterministic virtual-time driver with
//!   partitions, drops, crashes and an event log

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod codec;
mod config;
mod error;
mod node;
mod time;

pub mod component;
pub mod downing;
pub mod events;
pub mod membership;
pub mod protocol;
pub mod router;
pub mod sharding;
pub mod sim;
pub mod singleton;
pub mod transport;
pub mod wiring;

// Addressing
pub use address::{AddressParseError, NodeAddress, UniqueAddress};

// Codec
pub use codec::{CodecError, JsonCodec, MessageCodec};

// Configuration
pub use config::{
    ClusterSettings, ClusterSettingsBuilder, ConfigError, DowningSettings, DowningStrategyKind,
    FailureDetectorSettings, GossipSettings, RouterSettings, ShardingSettings, SingletonSettings,
    TieBreak,
};

// Errors
pub use error::{ClusterError, RouteError};

// Runtime
pub use component::Target;
pub use events::ClusterEvent;
pub use node::ClusterNode;
pub use protocol::RouteOutcome;
pub use router::ClusterRouter;
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
pub use wiring::{NodeConfig, NodeConfigBuilder};
