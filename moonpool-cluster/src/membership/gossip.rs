//! The gossiped membership state.
//!
//! A [`Gossip`] is the complete membership view one node holds: the members,
//! the reachability observations, the set of nodes known to have seen this
//! exact version, the vector clock versioning it, and tombstones for members
//! that were removed. Nodes exchange whole `Gossip` values and reconcile them
//! with [`Gossip::merge`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::member::{Member, MemberStatus};
use super::reachability::Reachability;
use super::vector_clock::{ClockOrdering, VectorClock};
use crate::UniqueAddress;

/// Membership view plus its versioning metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gossip {
    members: Vec<Member>,
    /// Reachability observations of all members.
    pub reachability: Reachability,
    /// Members known to have seen this version.
    pub seen: BTreeSet<UniqueAddress>,
    /// Version of this gossip.
    pub version: VectorClock,
    /// Removed members; never re-added by a merge.
    pub tombstones: BTreeSet<UniqueAddress>,
}

impl Gossip {
    /// Gossip containing a single member.
    pub fn single(member: Member) -> Self {
        let mut gossip = Self::default();
        gossip.put(member);
        gossip
    }

    /// Members sorted by address.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Look up a member.
    pub fn member(&self, node: &UniqueAddress) -> Option<&Member> {
        self.members.iter().find(|m| &m.node == node)
    }

    /// Look up a member by network address, ignoring the incarnation.
    pub fn member_at(&self, address: &crate::NodeAddress) -> Option<&Member> {
        self.members.iter().find(|m| m.node.address() == address)
    }

    /// Insert or replace a member, keeping the list sorted.
    pub fn put(&mut self, member: Member) {
        match self.members.binary_search_by(|m| m.node.cmp(&member.node)) {
            Ok(idx) => self.members[idx] = member,
            Err(idx) => self.members.insert(idx, member),
        }
    }

    /// Change the status of a member. Returns whether anything changed.
    pub fn set_status(&mut self, node: &UniqueAddress, status: MemberStatus) -> bool {
        match self.members.iter_mut().find(|m| &m.node == node) {
            Some(m) if m.status != status => {
                m.status = status;
                true
            }
            _ => false,
        }
    }

    /// Drop a member and tombstone it.
    pub fn remove(&mut self, node: &UniqueAddress) {
        self.members.retain(|m| &m.node != node);
        self.reachability = self.reachability.remove(node);
        self.seen.remove(node);
        self.version.prune(node);
        self.tombstones.insert(node.clone());
    }

    /// Whether `node` has been removed from the cluster.
    pub fn is_tombstoned(&self, node: &UniqueAddress) -> bool {
        self.tombstones.contains(node)
    }

    /// Record that `node` has seen this version.
    pub fn see(&mut self, node: &UniqueAddress) {
        self.seen.insert(node.clone());
    }

    /// Whether `node` has seen this version.
    pub fn has_seen(&self, node: &UniqueAddress) -> bool {
        self.seen.contains(node)
    }

    /// Bump the version on behalf of `node` after a local modification. The
    /// modifier is the only one that has seen the result.
    pub fn bump(&mut self, node: &UniqueAddress) {
        self.version.increment(node);
        self.seen.clear();
        self.seen.insert(node.clone());
    }

    fn member_set(&self) -> BTreeSet<UniqueAddress> {
        self.members.iter().map(|m| m.node.clone()).collect()
    }

    /// Reconcile two gossip versions.
    ///
    /// - `Same`: union of the seen sets.
    /// - one descends from the other: the newer one wins as is.
    /// - concurrent: members merged one by one (see [`Member::merge`]),
    ///   tombstones unioned, reachability merged per observer, clocks merged,
    ///   and the seen set reset (the caller marks itself as having seen it).
    pub fn merge(&self, other: &Gossip) -> Gossip {
        match self.version.compare(&other.version) {
            ClockOrdering::Same => {
                let mut merged = self.clone();
                merged.seen.extend(other.seen.iter().cloned());
                merged
            }
            ClockOrdering::Before => other.clone(),
            ClockOrdering::After => self.clone(),
            ClockOrdering::Concurrent => self.merge_concurrent(other),
        }
    }

    fn merge_concurrent(&self, other: &Gossip) -> Gossip {
        let tombstones: BTreeSet<UniqueAddress> =
            self.tombstones.union(&other.tombstones).cloned().collect();

        let mut merged = Gossip {
            tombstones: tombstones.clone(),
            ..Gossip::default()
        };
        let nodes: BTreeSet<UniqueAddress> = self
            .member_set()
            .union(&other.member_set())
            .cloned()
            .collect();
        for node in nodes.iter().filter(|n| !tombstones.contains(n)) {
            let member = match (self.member(node), other.member(node)) {
                (Some(a), Some(b)) => a.merge(b),
                (Some(a), None) => a.clone(),
                (None, Some(b)) => b.clone(),
                (None, None) => continue,
            };
            merged.put(member);
        }

        let allowed = merged.member_set();
        merged.reachability = self.reachability.merge(&allowed, &other.reachability);
        merged.version = self.version.merge(&other.version);
        for node in &tombstones {
            merged.version.prune(node);
        }
        merged
    }

    /// Whether every member that should acknowledge this version has seen
    /// it, given the unreachable set from the local point of view.
    ///
    /// Reachable members other than `Down` and `Exiting` must be in the seen
    /// set; unreachable members must already be `Down` or `Exiting`.
    pub fn converged(&self, unreachable: &BTreeSet<UniqueAddress>) -> bool {
        self.members.iter().all(|m| {
            let leaving_for_good = matches!(m.status, MemberStatus::Down | MemberStatus::Exiting);
            if unreachable.contains(&m.node) {
                leaving_for_good
            } else {
                leaving_for_good || self.seen.contains(&m.node)
            }
        })
    }
}
