//! Cluster membership.
//!
//! - [`member`]: member records and lifecycle status.
//! - [`vector_clock`], [`reachability`], [`gossip`]: the gossiped state and
//!   its merge rules.
//! - [`failure_detector`], [`heartbeat`]: phi-accrual detection over a
//!   monitoring ring.
//! - [`service`]: the [`MembershipService`] component.
//! - [`state`]: published [`ClusterState`] snapshots, leader and age ranking.

pub mod failure_detector;
pub mod gossip;
pub mod heartbeat;
pub mod member;
pub mod reachability;
pub mod service;
pub mod state;
pub mod vector_clock;

pub use failure_detector::PhiAccrualFailureDetector;
pub use gossip::Gossip;
pub use heartbeat::HeartbeatRing;
pub use member::{Member, MemberStatus};
pub use reachability::{Reachability, ReachabilityRecord, ReachabilityStatus};
pub use service::MembershipService;
pub use state::{
    leader_of, members_by_age, oldest_of, ClusterState, ClusterStateReport, MemberReport,
    MembershipVersion,
};
pub use vector_clock::{ClockOrdering, VectorClock};
