//! Published membership snapshots and the leader/oldest tracker.
//!
//! The membership service owns the [`Gossip`](super::Gossip). Everything
//! else sees an immutable [`ClusterState`] derived from it, published as an
//! `Arc` whenever it changes. The leader and the age ranking are pure
//! functions of the member list so every node computes the same answer from
//! the same view.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::member::{Member, MemberStatus};
use crate::UniqueAddress;

/// Monotonically increasing version of the snapshots published by a node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Return the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The leader: the lowest address among reachable `Up`/`Leaving` members.
///
/// While no member is `Up` yet (cluster bootstrap) the lowest reachable
/// `Joining`/`WeaklyUp` member leads, so that someone can promote the first
/// members.
pub fn leader_of(members: &[Member], unreachable: &BTreeSet<UniqueAddress>) -> Option<UniqueAddress> {
    let reachable = members.iter().filter(|m| !unreachable.contains(&m.node));
    let eligible = reachable
        .clone()
        .filter(|m| m.status.is_leader_eligible())
        .map(|m| &m.node)
        .min();
    eligible
        .or_else(|| {
            reachable
                .filter(|m| matches!(m.status, MemberStatus::Joining | MemberStatus::WeaklyUp))
                .map(|m| &m.node)
                .min()
        })
        .cloned()
}

/// `Up` members holding `role`, oldest first.
pub fn members_by_age<'a>(members: &'a [Member], role: Option<&str>) -> Vec<&'a Member> {
    let mut up: Vec<&Member> = members
        .iter()
        .filter(|m| m.status == MemberStatus::Up && m.has_role(role))
        .collect();
    up.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
    up
}

/// The oldest `Up` member holding `role`.
pub fn oldest_of(members: &[Member], role: Option<&str>) -> Option<UniqueAddress> {
    members_by_age(members, role)
        .first()
        .map(|m| m.node.clone())
}

/// Immutable snapshot of one node's membership view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterState {
    /// The node this view belongs to.
    pub self_node: UniqueAddress,
    /// Members sorted by address.
    pub members: Vec<Member>,
    /// Members unreachable from this node's point of view.
    pub unreachable: BTreeSet<UniqueAddress>,
    /// Current leader.
    pub leader: Option<UniqueAddress>,
    /// Oldest `Up` member.
    pub oldest: Option<UniqueAddress>,
    /// Whether the gossip has converged.
    pub converged: bool,
    /// Local publication counter.
    pub version: MembershipVersion,
}

impl ClusterState {
    /// Build a snapshot, deriving leader and oldest.
    pub fn new(
        self_node: UniqueAddress,
        members: Vec<Member>,
        unreachable: BTreeSet<UniqueAddress>,
        converged: bool,
        version: MembershipVersion,
    ) -> Self {
        let leader = leader_of(&members, &unreachable);
        let oldest = oldest_of(&members, None);
        Self {
            self_node,
            members,
            unreachable,
            leader,
            oldest,
            converged,
            version,
        }
    }

    /// Look up a member.
    pub fn member(&self, node: &UniqueAddress) -> Option<&Member> {
        self.members.iter().find(|m| &m.node == node)
    }

    /// This node's own member entry.
    pub fn self_member(&self) -> Option<&Member> {
        self.member(&self.self_node)
    }

    /// This node's status (`Removed` once it is gone from the view).
    pub fn self_status(&self) -> MemberStatus {
        self.self_member()
            .map_or(MemberStatus::Removed, |m| m.status)
    }

    /// Status of a member, `None` when it is not (or no longer) in the view.
    pub fn status_of(&self, node: &UniqueAddress) -> Option<MemberStatus> {
        self.member(node).map(|m| m.status)
    }

    /// Whether `node` is a live member: present and neither `Down` nor
    /// `Removed`.
    pub fn is_alive(&self, node: &UniqueAddress) -> bool {
        self.status_of(node).is_some_and(|s| !s.is_terminal())
    }

    /// Oldest `Up` member holding `role`.
    pub fn oldest_with_role(&self, role: Option<&str>) -> Option<UniqueAddress> {
        oldest_of(&self.members, role)
    }

    /// `Up` members holding `role`, oldest first.
    pub fn by_age(&self, role: Option<&str>) -> Vec<&Member> {
        members_by_age(&self.members, role)
    }

    /// Whether this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.leader.as_ref() == Some(&self.self_node)
    }

    /// Read-only report for monitoring.
    pub fn report(&self) -> ClusterStateReport {
        ClusterStateReport {
            members: self
                .members
                .iter()
                .map(|m| MemberReport {
                    address: m.node.address().to_string(),
                    status: m.status,
                    roles: m.roles.iter().cloned().collect(),
                })
                .collect(),
            unreachable: self
                .unreachable
                .iter()
                .map(|n| n.address().to_string())
                .collect(),
            leader: self.leader.as_ref().map(|n| n.address().to_string()),
            oldest: self.oldest.as_ref().map(|n| n.address().to_string()),
        }
    }

    /// The report rendered as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.report())
    }
}

/// One member in a [`ClusterStateReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberReport {
    /// `host:port`.
    pub address: String,
    /// Status.
    pub status: MemberStatus,
    /// Roles.
    pub roles: Vec<String>,
}

/// Cluster state query result: `{members, unreachable, leader, oldest}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateReport {
    /// Members.
    pub members: Vec<MemberReport>,
    /// Unreachable addresses.
    pub unreachable: Vec<String>,
    /// Leader address.
    pub leader: Option<String>,
    /// Oldest address.
    pub oldest: Option<String>,
}
