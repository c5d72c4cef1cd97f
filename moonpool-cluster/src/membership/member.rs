//! Cluster members and their lifecycle status.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::UniqueAddress;

/// Lifecycle status of a member.
///
/// The declaration order is also the merge precedence: when two concurrent
/// gossip versions disagree about a member, the status that is later in the
/// lifecycle wins (`Removed > Down > Exiting > Leaving > Up > WeaklyUp >
/// Joining`). Status therefore only ever moves forward for a given
/// incarnation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MemberStatus {
    /// Announced to the cluster, not yet accepted by the leader.
    Joining,
    /// Accepted while convergence is blocked by unreachable members.
    WeaklyUp,
    /// Full member.
    Up,
    /// Asked to leave; handing off shards and singletons.
    Leaving,
    /// Handoff complete; about to be removed.
    Exiting,
    /// Declared dead by the split-brain resolver.
    Down,
    /// Gone from the cluster.
    Removed,
}

impl MemberStatus {
    /// Whether the member counts when deciding partitions and quorums.
    pub fn is_considered(self) -> bool {
        matches!(self, Self::Up | Self::Leaving)
    }

    /// Whether the member may act as leader.
    pub fn is_leader_eligible(self) -> bool {
        matches!(self, Self::Up | Self::Leaving)
    }

    /// Whether the member is on its way out or already gone.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Down | Self::Removed)
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Joining => "Joining",
            Self::WeaklyUp => "WeaklyUp",
            Self::Up => "Up",
            Self::Leaving => "Leaving",
            Self::Exiting => "Exiting",
            Self::Down => "Down",
            Self::Removed => "Removed",
        };
        f.write_str(name)
    }
}

/// A member of the cluster as seen in gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Address and incarnation.
    pub node: UniqueAddress,
    /// Lifecycle status.
    pub status: MemberStatus,
    /// Age rank assigned by the leader when the member moves to `Up`.
    /// Lower is older.
    pub ordinal: Option<u64>,
    /// Roles the node advertised when joining.
    pub roles: BTreeSet<String>,
    /// Set by the member itself once its shards and singletons are handed
    /// off, so the leader may move it from `Leaving` to `Exiting`.
    pub ready_to_exit: bool,
}

impl Member {
    /// A freshly joining member.
    pub fn joining(node: UniqueAddress, roles: BTreeSet<String>) -> Self {
        Self {
            node,
            status: MemberStatus::Joining,
            ordinal: None,
            roles,
            ready_to_exit: false,
        }
    }

    /// Whether the member advertises `role` (always true for `None`).
    pub fn has_role(&self, role: Option<&str>) -> bool {
        role.map_or(true, |r| self.roles.contains(r))
    }

    /// Ordering key for age: ordinal first, address second. Members without
    /// an ordinal sort after every member that has one.
    pub fn age_key(&self) -> (u64, &UniqueAddress) {
        (self.ordinal.unwrap_or(u64::MAX), &self.node)
    }

    /// Combine two concurrent views of the same member.
    pub fn merge(&self, other: &Member) -> Member {
        let ordinal = match (self.ordinal, other.ordinal) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Member {
            node: self.node.clone(),
            status: self.status.max(other.status),
            ordinal,
            roles: self.roles.union(&other.roles).cloned().collect(),
            ready_to_exit: self.ready_to_exit || other.ready_to_exit,
        }
    }
}
