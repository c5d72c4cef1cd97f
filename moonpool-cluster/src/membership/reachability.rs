//! Reachability observations.
//!
//! Every member records what its own failure detector concludes about the
//! members it monitors. Those records travel with the gossip as
//! observations: each observer owns its rows, and a row is replaced only by a
//! newer row from the same observer. The cluster-wide unreachable set is
//! derived from the rows, never stored.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::UniqueAddress;

/// What an observer concluded about a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReachabilityStatus {
    /// Heartbeats arrive.
    Reachable,
    /// The failure detector crossed its threshold.
    Unreachable,
}

/// One observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachabilityRecord {
    /// Member that made the observation.
    pub observer: UniqueAddress,
    /// Member the observation is about.
    pub subject: UniqueAddress,
    /// The observed status.
    pub status: ReachabilityStatus,
    /// Observer-local version at which the row was last changed.
    pub since: u64,
}

/// All observations known to a member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reachability {
    records: Vec<ReachabilityRecord>,
    #[serde(with = "observer_versions")]
    versions: BTreeMap<UniqueAddress, u64>,
}

/// Observer versions travel as a list of pairs; JSON object keys must be
/// strings.
mod observer_versions {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::UniqueAddress;

    pub fn serialize<S: Serializer>(
        versions: &BTreeMap<UniqueAddress, u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(versions.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<UniqueAddress, u64>, D::Error> {
        let pairs = Vec::<(UniqueAddress, u64)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl Reachability {
    /// No observations.
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, sorted by observer then subject.
    pub fn records(&self) -> &[ReachabilityRecord] {
        &self.records
    }

    fn version_of(&self, observer: &UniqueAddress) -> u64 {
        self.versions.get(observer).copied().unwrap_or(0)
    }

    fn change(&self, observer: &UniqueAddress, subject: &UniqueAddress, status: ReachabilityStatus) -> Self {
        let existing = self
            .records
            .iter()
            .find(|r| &r.observer == observer && &r.subject == subject);
        match (existing, status) {
            (Some(r), s) if r.status == s => return self.clone(),
            (None, ReachabilityStatus::Reachable) => return self.clone(),
            _ => {}
        }

        let version = self.version_of(observer) + 1;
        let mut records: Vec<ReachabilityRecord> = self
            .records
            .iter()
            .filter(|r| !(&r.observer == observer && &r.subject == subject))
            .cloned()
            .collect();

        let observer_rows_unreachable = records
            .iter()
            .any(|r| &r.observer == observer && r.status == ReachabilityStatus::Unreachable);
        if status == ReachabilityStatus::Reachable && !observer_rows_unreachable {
            // the observer sees everyone again: its rows collapse to nothing
            records.retain(|r| &r.observer != observer);
        } else {
            records.push(ReachabilityRecord {
                observer: observer.clone(),
                subject: subject.clone(),
                status,
                since: version,
            });
        }
        records.sort_by(|a, b| (&a.observer, &a.subject).cmp(&(&b.observer, &b.subject)));

        let mut versions = self.versions.clone();
        versions.insert(observer.clone(), version);
        Self { records, versions }
    }

    /// Record that `observer` can no longer reach `subject`.
    pub fn unreachable(&self, observer: &UniqueAddress, subject: &UniqueAddress) -> Self {
        self.change(observer, subject, ReachabilityStatus::Unreachable)
    }

    /// Record that `observer` reaches `subject` again.
    pub fn reachable(&self, observer: &UniqueAddress, subject: &UniqueAddress) -> Self {
        self.change(observer, subject, ReachabilityStatus::Reachable)
    }

    /// Merge with another member's view. For each observer in `allowed`, the
    /// rows of the side with the higher observer version win; rows of
    /// observers outside `allowed` and about subjects outside it are dropped.
    pub fn merge(&self, allowed: &BTreeSet<UniqueAddress>, other: &Reachability) -> Self {
        let mut records = Vec::new();
        let mut versions = BTreeMap::new();
        for observer in allowed {
            let mine = self.version_of(observer);
            let theirs = other.version_of(observer);
            let source = if theirs > mine { other } else { self };
            let version = mine.max(theirs);
            if version > 0 {
                versions.insert(observer.clone(), version);
            }
            records.extend(
                source
                    .records
                    .iter()
                    .filter(|r| &r.observer == observer && allowed.contains(&r.subject))
                    .cloned(),
            );
        }
        records.sort_by(|a, b| (&a.observer, &a.subject).cmp(&(&b.observer, &b.subject)));
        Self { records, versions }
    }

    /// Drop every row made by or about `node`.
    pub fn remove(&self, node: &UniqueAddress) -> Self {
        let records = self
            .records
            .iter()
            .filter(|r| &r.observer != node && &r.subject != node)
            .cloned()
            .collect();
        let mut versions = self.versions.clone();
        versions.remove(node);
        Self { records, versions }
    }

    /// Subjects `observer` currently reports unreachable.
    pub fn unreachable_by(&self, observer: &UniqueAddress) -> BTreeSet<UniqueAddress> {
        self.records
            .iter()
            .filter(|r| &r.observer == observer && r.status == ReachabilityStatus::Unreachable)
            .map(|r| r.subject.clone())
            .collect()
    }

    /// Every subject reported unreachable by at least one observer.
    pub fn all_unreachable(&self) -> BTreeSet<UniqueAddress> {
        self.records
            .iter()
            .filter(|r| r.status == ReachabilityStatus::Unreachable)
            .map(|r| r.subject.clone())
            .collect()
    }

    /// The unreachable set as seen from `viewer`.
    ///
    /// A subject is unreachable when an observer that is not itself
    /// unreachable reports it. The viewer's own observations always count,
    /// since the viewer knows it is alive.
    pub fn unreachable_from(&self, viewer: &UniqueAddress) -> BTreeSet<UniqueAddress> {
        let suspected = self.all_unreachable();
        self.records
            .iter()
            .filter(|r| r.status == ReachabilityStatus::Unreachable)
            .filter(|r| &r.observer == viewer || !suspected.contains(&r.observer))
            .map(|r| r.subject.clone())
            .collect()
    }

    /// Whether no observer reports anything unreachable.
    pub fn is_all_reachable(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.status == ReachabilityStatus::Reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeAddress;

    fn node(port: u16) -> UniqueAddress {
        UniqueAddress::new(NodeAddress::new("127.0.0.1", port), 1)
    }

    #[test]
    fn test_unreachable_then_reachable_collapses_rows() {
        let r = Reachability::new().unreachable(&node(1), &node(2));
        assert_eq!(r.all_unreachable(), BTreeSet::from([node(2)]));
        let r = r.reachable(&node(1), &node(2));
        assert!(r.records().is_empty());
        assert!(r.is_all_reachable());
    }

    #[test]
    fn test_reachable_without_prior_row_is_noop() {
        let r = Reachability::new().reachable(&node(1), &node(2));
        assert_eq!(r, Reachability::new());
    }

    #[test]
    fn test_merge_keeps_newest_rows_per_observer() {
        let allowed = BTreeSet::from([node(1), node(2), node(3)]);
        let base = Reachability::new().unreachable(&node(1), &node(3));
        let healed = base.reachable(&node(1), &node(3));
        let other = Reachability::new().unreachable(&node(2), &node(3));

        let merged = base.merge(&allowed, &other);
        assert_eq!(merged.all_unreachable(), BTreeSet::from([node(3)]));
        assert_eq!(merged.unreachable_by(&node(2)), BTreeSet::from([node(3)]));

        let merged = merged.merge(&allowed, &healed);
        assert!(merged.unreachable_by(&node(1)).is_empty());
        assert_eq!(merged.unreachable_by(&node(2)), BTreeSet::from([node(3)]));
    }

    #[test]
    fn test_observations_of_unreachable_observers_are_ignored() {
        // 1 and 2 cannot see each other; 3 cannot see 2.
        let r = Reachability::new()
            .unreachable(&node(1), &node(2))
            .unreachable(&node(2), &node(1))
            .unreachable(&node(3), &node(2));
        let from_one = r.unreachable_from(&node(1));
        assert_eq!(from_one, BTreeSet::from([node(2)]));
    }

    #[test]
    fn test_incarnations_keep_separate_versions() {
        let old = node(2);
        let new = UniqueAddress::new(NodeAddress::new("127.0.0.1", 2), 2);
        let r = Reachability::new()
            .unreachable(&old, &node(1))
            .reachable(&old, &node(1))
            .unreachable(&new, &node(3));
        assert_eq!(r.version_of(&old), 2);
        assert_eq!(r.version_of(&new), 1);

        let r = r.remove(&old);
        assert_eq!(r.version_of(&old), 0);
        assert_eq!(r.version_of(&new), 1);
    }

    #[test]
    fn test_versions_survive_gossip_encoding() {
        let allowed = BTreeSet::from([node(1), node(2), node(3)]);
        let healed = Reachability::new()
            .unreachable(&node(1), &node(3))
            .reachable(&node(1), &node(3));
        let stale = Reachability::new().unreachable(&node(1), &node(3));

        let json = serde_json::to_string(&healed).expect("encode");
        let decoded: Reachability = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, healed);
        assert_eq!(decoded.version_of(&node(1)), 2);
        // the newer, healed row still beats the stale one after decoding
        assert!(stale.merge(&allowed, &decoded).is_all_reachable());
    }

    #[test]
    fn test_remove_drops_rows_of_node() {
        let r = Reachability::new()
            .unreachable(&node(1), &node(2))
            .unreachable(&node(2), &node(3));
        let r = r.remove(&node(2));
        assert!(r.records().is_empty());
    }
}
