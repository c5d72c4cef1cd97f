//! Heartbeat scheduling over a monitoring ring.
//!
//! Each member monitors a bounded number of other members rather than all of
//! them. Members are placed on a ring ordered by the CRC32C hash of their
//! address, and a member monitors the `monitored_by_nr_of_members` members
//! that follow it on the ring. On top of the ring, a member keeps monitoring
//! every member it currently reports unreachable so that it notices when they
//! come back.
//!
//! ```text
//!   self ──Heartbeat{seq}──▶ target
//!   self ◀─HeartbeatRsp{seq}─ target     → detector.heartbeat(now)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::failure_detector::PhiAccrualFailureDetector;
use super::member::{Member, MemberStatus};
use crate::config::FailureDetectorSettings;
use crate::UniqueAddress;

/// Tracks which members to heartbeat and their failure detectors.
#[derive(Debug, Clone)]
pub struct HeartbeatRing {
    settings: FailureDetectorSettings,
    self_node: UniqueAddress,
    detectors: BTreeMap<UniqueAddress, PhiAccrualFailureDetector>,
    sequence: u64,
    last_sent: Option<Duration>,
}

fn ring_position(node: &UniqueAddress) -> (u32, UniqueAddress) {
    (crc32c::crc32c(node.to_string().as_bytes()), node.clone())
}

impl HeartbeatRing {
    /// Create an empty ring for `self_node`.
    pub fn new(settings: FailureDetectorSettings, self_node: UniqueAddress) -> Self {
        Self {
            settings,
            self_node,
            detectors: BTreeMap::new(),
            sequence: 0,
            last_sent: None,
        }
    }

    /// Members currently monitored.
    pub fn targets(&self) -> impl Iterator<Item = &UniqueAddress> {
        self.detectors.keys()
    }

    /// Recompute the monitored set from the current members and the members
    /// this node itself reports unreachable.
    pub fn update(&mut self, now: Duration, members: &[Member], my_unreachable: &BTreeSet<UniqueAddress>) {
        let mut ring: Vec<(u32, UniqueAddress)> = members
            .iter()
            .filter(|m| !matches!(m.status, MemberStatus::Down | MemberStatus::Removed))
            .map(|m| ring_position(&m.node))
            .collect();
        let me = ring_position(&self.self_node);
        if !ring.contains(&me) {
            ring.push(me.clone());
        }
        ring.sort();

        let mut wanted: BTreeSet<UniqueAddress> = BTreeSet::new();
        if let Some(pos) = ring.iter().position(|p| p == &me) {
            let n = ring.len();
            for step in 1..n {
                if wanted.len() >= self.settings.monitored_by_nr_of_members {
                    break;
                }
                wanted.insert(ring[(pos + step) % n].1.clone());
            }
        }
        let live: BTreeSet<&UniqueAddress> = members
            .iter()
            .filter(|m| !matches!(m.status, MemberStatus::Down | MemberStatus::Removed))
            .map(|m| &m.node)
            .collect();
        wanted.extend(
            my_unreachable
                .iter()
                .filter(|n| live.contains(n) && **n != self.self_node)
                .cloned(),
        );

        self.detectors.retain(|node, _| wanted.contains(node));
        for node in wanted {
            self.detectors.entry(node).or_insert_with(|| {
                let mut detector = PhiAccrualFailureDetector::new(&self.settings);
                // a target that never answers must still become suspect
                detector.heartbeat(now);
                detector
            });
        }
    }

    /// If the heartbeat interval has elapsed, return the heartbeats to send.
    pub fn tick(&mut self, now: Duration) -> Vec<(UniqueAddress, u64)> {
        let due = self
            .last_sent
            .map_or(true, |last| now.saturating_sub(last) >= self.settings.heartbeat_interval);
        if !due {
            return Vec::new();
        }
        self.last_sent = Some(now);
        self.sequence += 1;
        self.detectors
            .keys()
            .map(|node| (node.clone(), self.sequence))
            .collect()
    }

    /// Record a heartbeat response from `from`.
    pub fn on_response(&mut self, now: Duration, from: &UniqueAddress) {
        if let Some(detector) = self.detectors.get_mut(from) {
            detector.heartbeat(now);
        }
    }

    /// Monitored members whose detector currently reports them unavailable.
    pub fn unavailable(&self, now: Duration) -> BTreeSet<UniqueAddress> {
        self.detectors
            .iter()
            .filter(|(_, d)| !d.is_available(now))
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Monitored members whose detector currently reports them available.
    pub fn available(&self, now: Duration) -> BTreeSet<UniqueAddress> {
        self.detectors
            .iter()
            .filter(|(_, d)| d.is_available(now))
            .map(|(node, _)| node.clone())
            .collect()
    }
}
