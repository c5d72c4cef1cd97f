//! The membership service.
//!
//! Owns this node's [`Gossip`] and runs every membership protocol on the
//! component tick:
//!
//! - **join**: contact the seeds until one of them welcomes us; the first
//!   seed joins itself when no other seed answers within
//!   `seed_node_timeout`.
//! - **gossip**: every `gossip_interval`, pick one peer, preferring peers
//!   that have not seen our version and among those the least recently
//!   contacted, and send either the full gossip or a version digest.
//! - **failure detection**: heartbeat the ring successors and record
//!   reachability observations from the phi-accrual detectors.
//! - **leader actions**: the leader promotes joiners, moves drained leavers
//!   to `Exiting`, and removes `Exiting`/`Down` members once the gossip has
//!   converged.
//!
//! Every change publishes a fresh [`ClusterState`] to the other components.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use super::gossip::Gossip;
use super::heartbeat::HeartbeatRing;
use super::member::{Member, MemberStatus};
use super::state::{ClusterState, MembershipVersion};
use super::vector_clock::{ClockOrdering, VectorClock};
use crate::component::{Component, ComponentId, Input, LocalEvent, Outbox};
use crate::config::ClusterSettings;
use crate::events::ClusterEvent;
use crate::protocol::{ClusterMessage, MembershipMessage};
use crate::UniqueAddress;

/// Membership service component.
pub struct MembershipService {
    settings: ClusterSettings,
    self_node: UniqueAddress,
    gossip: Gossip,
    joined: bool,
    join_started: Option<Duration>,
    last_join_attempt: Option<Duration>,
    heartbeat: HeartbeatRing,
    last_gossip: Option<Duration>,
    last_leader_actions: Option<Duration>,
    last_contacted: BTreeMap<UniqueAddress, Duration>,
    rng: ChaCha8Rng,
    drain_participants: BTreeSet<ComponentId>,
    drained: BTreeSet<ComponentId>,
    tombstone_seen: BTreeMap<UniqueAddress, Duration>,
    published: Option<Arc<ClusterState>>,
    version: MembershipVersion,
    self_downed: bool,
    self_removed: bool,
    leave_requested: bool,
}

impl MembershipService {
    /// Create the service. `drain_participants` are the components that must
    /// report [`LocalEvent::Drained`] before this node may exit after a
    /// graceful leave.
    pub fn new(
        settings: ClusterSettings,
        self_node: UniqueAddress,
        drain_participants: BTreeSet<ComponentId>,
    ) -> Self {
        let seed = u64::from(crc32c::crc32c(self_node.to_string().as_bytes()));
        Self {
            heartbeat: HeartbeatRing::new(settings.failure_detector.clone(), self_node.clone()),
            settings,
            self_node,
            gossip: Gossip::default(),
            joined: false,
            join_started: None,
            last_join_attempt: None,
            last_gossip: None,
            last_leader_actions: None,
            last_contacted: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            drain_participants,
            drained: BTreeSet::new(),
            tombstone_seen: BTreeMap::new(),
            published: None,
            version: MembershipVersion::default(),
            self_downed: false,
            self_removed: false,
            leave_requested: false,
        }
    }

    /// The current gossip.
    pub fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    /// The last published snapshot.
    pub fn state(&self) -> Option<&Arc<ClusterState>> {
        self.published.as_ref()
    }

    fn stopped(&self) -> bool {
        self.self_downed || self.self_removed
    }

    fn unreachable(&self) -> BTreeSet<UniqueAddress> {
        self.gossip
            .reachability
            .unreachable_from(&self.self_node)
            .into_iter()
            .filter(|n| self.gossip.member(n).is_some())
            .collect()
    }

    fn modified(&mut self) {
        self.gossip.bump(&self.self_node);
    }

    // ---------------------------------------------------------------------
    // Join
    // ---------------------------------------------------------------------

    fn join_tick(&mut self, now: Duration, out: &mut Outbox) {
        let started = *self.join_started.get_or_insert(now);
        let seeds = &self.settings.seed_nodes;
        let me = self.self_node.address();

        let first_seed = seeds.first().is_some_and(|s| s == me);
        let others: Vec<_> = seeds.iter().filter(|s| *s != me).cloned().collect();
        if seeds.is_empty()
            || others.is_empty()
            || (first_seed && now.saturating_sub(started) >= self.settings.gossip.seed_node_timeout)
        {
            self.join_self();
            return;
        }

        let due = self.last_join_attempt.map_or(true, |last| {
            now.saturating_sub(last) >= self.settings.gossip.retry_unsuccessful_join_after
        });
        if due {
            self.last_join_attempt = Some(now);
            debug!(node = %self.self_node, seeds = others.len(), "sending join to seed nodes");
            for seed in others {
                out.send_to(
                    seed,
                    ClusterMessage::Membership(MembershipMessage::Join {
                        roles: self.settings.roles.clone(),
                    }),
                );
            }
        }
    }

    fn join_self(&mut self) {
        info!(node = %self.self_node, "no seed answered, joining self as first member");
        self.gossip = Gossip::single(Member::joining(
            self.self_node.clone(),
            self.settings.roles.clone(),
        ));
        self.modified();
        self.joined = true;
    }

    fn on_join(&mut self, from: UniqueAddress, roles: BTreeSet<String>, out: &mut Outbox) {
        if !self.joined {
            debug!(node = %self.self_node, joiner = %from, "ignoring join, not a member yet");
            return;
        }
        if self.gossip.is_tombstoned(&from) {
            debug!(joiner = %from, "ignoring join from removed incarnation");
            return;
        }
        if self.gossip.member(&from).is_some() {
            // lost welcome: answer again
            self.send_welcome(&from, out);
            return;
        }
        if let Some(previous) = self.gossip.member_at(from.address()).cloned() {
            if previous.node.incarnation() > from.incarnation() {
                debug!(joiner = %from, current = %previous.node, "ignoring join from stale incarnation");
                return;
            }
            if !previous.status.is_terminal() {
                info!(
                    previous = %previous.node,
                    joiner = %from,
                    "new incarnation joining, downing previous incarnation"
                );
                self.gossip.set_status(&previous.node, MemberStatus::Down);
                self.modified();
            }
            // the joiner retries until the previous incarnation is removed
            return;
        }

        info!(node = %self.self_node, joiner = %from, "admitting joining member");
        self.gossip.put(Member::joining(from.clone(), roles));
        self.modified();
        self.send_welcome(&from, out);
    }

    fn send_welcome(&self, to: &UniqueAddress, out: &mut Outbox) {
        out.send(
            to,
            ClusterMessage::Membership(MembershipMessage::Welcome {
                gossip: self.gossip.clone(),
            }),
        );
    }

    fn on_welcome(&mut self, from: UniqueAddress, gossip: Gossip) {
        if self.joined {
            return;
        }
        if gossip.member(&self.self_node).is_none() {
            warn!(seed = %from, "welcome does not contain this node, ignoring");
            return;
        }
        info!(node = %self.self_node, seed = %from, "welcomed into cluster");
        self.gossip = gossip;
        self.gossip.see(&self.self_node);
        self.joined = true;
    }

    // ---------------------------------------------------------------------
    // Gossip
    // ---------------------------------------------------------------------

    fn gossip_tick(&mut self, now: Duration, out: &mut Outbox) {
        let due = self
            .last_gossip
            .map_or(true, |last| now.saturating_sub(last) >= self.settings.gossip.gossip_interval);
        if !due {
            return;
        }
        self.last_gossip = Some(now);

        let my_unreachable = self.gossip.reachability.unreachable_by(&self.self_node);
        let candidates: Vec<UniqueAddress> = self
            .gossip
            .members()
            .iter()
            .filter(|m| m.node != self.self_node)
            .filter(|m| !m.status.is_terminal())
            .filter(|m| !my_unreachable.contains(&m.node))
            .map(|m| m.node.clone())
            .collect();
        if candidates.is_empty() {
            return;
        }

        let unseen: Vec<UniqueAddress> = candidates
            .iter()
            .filter(|n| !self.gossip.has_seen(n))
            .cloned()
            .collect();
        let pool = if unseen.is_empty() { candidates } else { unseen };

        let oldest_contact = pool
            .iter()
            .map(|n| self.last_contacted.get(n).copied().unwrap_or(Duration::ZERO))
            .min()
            .unwrap_or(Duration::ZERO);
        let least_recent: Vec<&UniqueAddress> = pool
            .iter()
            .filter(|n| self.last_contacted.get(*n).copied().unwrap_or(Duration::ZERO) == oldest_contact)
            .collect();
        let peer = least_recent[self.rng.gen_range(0..least_recent.len())].clone();
        self.last_contacted.insert(peer.clone(), now);

        let message = if self.gossip.has_seen(&peer) {
            MembershipMessage::GossipStatus {
                to: peer.clone(),
                version: self.gossip.version.clone(),
            }
        } else {
            MembershipMessage::Gossip {
                to: peer.clone(),
                gossip: self.gossip.clone(),
            }
        };
        out.send(&peer, ClusterMessage::Membership(message));
    }

    fn send_gossip(&self, to: &UniqueAddress, out: &mut Outbox) {
        out.send(
            to,
            ClusterMessage::Membership(MembershipMessage::Gossip {
                to: to.clone(),
                gossip: self.gossip.clone(),
            }),
        );
    }

    fn on_gossip(&mut self, from: UniqueAddress, remote: Gossip, out: &mut Outbox) {
        if remote.member(&self.self_node).is_none() {
            if remote.is_tombstoned(&self.self_node) && self.joined {
                self.gossip = self.gossip.merge(&remote);
                self.mark_removed();
            }
            return;
        }
        if !self.joined {
            // a lost welcome is replaced by any gossip that contains us
            self.gossip = remote;
            self.gossip.see(&self.self_node);
            self.joined = true;
            return;
        }
        if self.gossip.is_tombstoned(&from) {
            return;
        }

        let ordering = self.gossip.version.compare(&remote.version);
        self.gossip = self.gossip.merge(&remote);
        self.gossip.see(&self.self_node);
        let peer_behind = matches!(ordering, ClockOrdering::After | ClockOrdering::Concurrent);
        if peer_behind || self.gossip.seen != remote.seen {
            // the reply either brings the peer up to date or tells it who
            // has seen the version, which is what convergence waits for
            debug!(from = %from, ?ordering, "gossiping back");
            self.send_gossip(&from, out);
        }
    }

    fn on_gossip_status(&mut self, from: UniqueAddress, version: VectorClock, out: &mut Outbox) {
        if !self.joined || self.gossip.is_tombstoned(&from) {
            return;
        }
        match self.gossip.version.compare(&version) {
            ClockOrdering::Same => {
                self.gossip.see(&from);
            }
            ClockOrdering::After | ClockOrdering::Concurrent => self.send_gossip(&from, out),
            ClockOrdering::Before => out.send(
                &from,
                ClusterMessage::Membership(MembershipMessage::GossipStatus {
                    to: from.clone(),
                    version: self.gossip.version.clone(),
                }),
            ),
        }
    }

    // ---------------------------------------------------------------------
    // Failure detection
    // ---------------------------------------------------------------------

    fn heartbeat_tick(&mut self, now: Duration, out: &mut Outbox) {
        let my_unreachable = self.gossip.reachability.unreachable_by(&self.self_node);
        self.heartbeat
            .update(now, self.gossip.members(), &my_unreachable);
        for (target, sequence) in self.heartbeat.tick(now) {
            out.send(
                &target,
                ClusterMessage::Membership(MembershipMessage::Heartbeat {
                    to: target.clone(),
                    sequence,
                }),
            );
        }

        let mut reachability = self.gossip.reachability.clone();
        for node in self.heartbeat.unavailable(now) {
            if !my_unreachable.contains(&node) {
                warn!(observer = %self.self_node, subject = %node, "marking node unreachable");
                reachability = reachability.unreachable(&self.self_node, &node);
            }
        }
        let available = self.heartbeat.available(now);
        for node in &my_unreachable {
            if available.contains(node) {
                info!(observer = %self.self_node, subject = %node, "node reachable again");
                reachability = reachability.reachable(&self.self_node, node);
            }
        }
        if reachability != self.gossip.reachability {
            self.gossip.reachability = reachability;
            self.modified();
        }
    }

    // ---------------------------------------------------------------------
    // Leader actions
    // ---------------------------------------------------------------------

    fn leader_actions_tick(&mut self, now: Duration, out: &mut Outbox) {
        let due = self.last_leader_actions.map_or(true, |last| {
            now.saturating_sub(last) >= self.settings.gossip.leader_actions_interval
        });
        if !due {
            return;
        }
        self.last_leader_actions = Some(now);

        let unreachable = self.unreachable();
        let leader = super::state::leader_of(self.gossip.members(), &unreachable);
        if leader.as_ref() != Some(&self.self_node) {
            return;
        }

        if self.gossip.converged(&unreachable) {
            self.leader_actions_converged(now, &unreachable, out);
        } else if self.settings.gossip.allow_weakly_up && !unreachable.is_empty() {
            let joiners: Vec<UniqueAddress> = self
                .gossip
                .members()
                .iter()
                .filter(|m| m.status == MemberStatus::Joining && !unreachable.contains(&m.node))
                .map(|m| m.node.clone())
                .collect();
            if !joiners.is_empty() {
                for node in &joiners {
                    info!(leader = %self.self_node, node = %node, "leader moving member to WeaklyUp");
                    self.gossip.set_status(node, MemberStatus::WeaklyUp);
                }
                self.modified();
            }
        }
    }

    fn acknowledged_by_majority(&self) -> bool {
        let up: Vec<&Member> = self
            .gossip
            .members()
            .iter()
            .filter(|m| m.status == MemberStatus::Up)
            .collect();
        if up.is_empty() {
            return true;
        }
        let seen = up.iter().filter(|m| self.gossip.has_seen(&m.node)).count();
        seen * 2 > up.len()
    }

    fn leader_actions_converged(
        &mut self,
        now: Duration,
        unreachable: &BTreeSet<UniqueAddress>,
        out: &mut Outbox,
    ) {
        let mut changed = false;

        // removals first, so that a member moved to Exiting in this pass is
        // removed only after everyone has seen it exiting
        let to_remove: Vec<Member> = self
            .gossip
            .members()
            .iter()
            .filter(|m| matches!(m.status, MemberStatus::Exiting | MemberStatus::Down))
            .filter(|m| m.node != self.self_node)
            .cloned()
            .collect();
        for member in &to_remove {
            info!(leader = %self.self_node, node = %member.node, status = %member.status, "leader removing member");
            self.gossip.remove(&member.node);
            self.tombstone_seen.insert(member.node.clone(), now);
            changed = true;
        }

        let leavers: Vec<UniqueAddress> = self
            .gossip
            .members()
            .iter()
            .filter(|m| m.status == MemberStatus::Leaving && m.ready_to_exit)
            .map(|m| m.node.clone())
            .collect();
        for node in &leavers {
            info!(leader = %self.self_node, node = %node, "leader moving member to Exiting");
            self.gossip.set_status(node, MemberStatus::Exiting);
            changed = true;
        }

        if self.acknowledged_by_majority() {
            let mut next_ordinal = self
                .gossip
                .members()
                .iter()
                .filter_map(|m| m.ordinal)
                .max()
                .map_or(1, |max| max + 1);
            let joiners: Vec<Member> = self
                .gossip
                .members()
                .iter()
                .filter(|m| matches!(m.status, MemberStatus::Joining | MemberStatus::WeaklyUp))
                .filter(|m| !unreachable.contains(&m.node))
                .cloned()
                .collect();
            for mut member in joiners {
                info!(leader = %self.self_node, node = %member.node, ordinal = next_ordinal, "leader moving member to Up");
                member.status = MemberStatus::Up;
                if member.ordinal.is_none() {
                    member.ordinal = Some(next_ordinal);
                    next_ordinal += 1;
                }
                self.gossip.put(member);
                changed = true;
            }
        }

        let grace = self.settings.gossip.prune_grace;
        let expired: Vec<UniqueAddress> = self
            .gossip
            .tombstones
            .iter()
            .filter(|t| {
                let seen = *self.tombstone_seen.entry((*t).clone()).or_insert(now);
                now.saturating_sub(seen) >= grace
            })
            .cloned()
            .collect();
        for node in &expired {
            debug!(node = %node, "pruning tombstone");
            self.gossip.tombstones.remove(node);
            self.tombstone_seen.remove(node);
            changed = true;
        }

        if changed {
            self.modified();
            // exiting members learn about their removal from the leader
            for member in to_remove.iter().filter(|m| m.status == MemberStatus::Exiting) {
                self.send_gossip(&member.node, out);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Local requests
    // ---------------------------------------------------------------------

    fn on_down(&mut self, nodes: Vec<UniqueAddress>) {
        let mut changed = false;
        for node in nodes {
            if self
                .gossip
                .member(&node)
                .is_some_and(|m| !m.status.is_terminal())
            {
                info!(node = %node, by = %self.self_node, "marking member Down");
                self.gossip.set_status(&node, MemberStatus::Down);
                changed = true;
            }
        }
        if changed {
            self.modified();
        }
    }

    fn try_leave(&mut self) {
        if !self.leave_requested || !self.joined {
            return;
        }
        let status = self.gossip.member(&self.self_node).map(|m| m.status);
        if matches!(
            status,
            Some(MemberStatus::Joining | MemberStatus::WeaklyUp | MemberStatus::Up)
        ) {
            info!(node = %self.self_node, "leaving cluster");
            self.gossip
                .set_status(&self.self_node, MemberStatus::Leaving);
            self.modified();
        }
    }

    fn check_ready_to_exit(&mut self) {
        let Some(me) = self.gossip.member(&self.self_node) else {
            return;
        };
        if me.status != MemberStatus::Leaving || me.ready_to_exit {
            return;
        }
        if self.drain_participants.is_subset(&self.drained) {
            info!(node = %self.self_node, "handoff complete, ready to exit");
            let mut me = me.clone();
            me.ready_to_exit = true;
            self.gossip.put(me);
            self.modified();
        }
    }

    fn mark_removed(&mut self) {
        if !self.self_removed {
            info!(node = %self.self_node, "this node has been removed from the cluster");
            self.self_removed = true;
        }
    }

    // ---------------------------------------------------------------------
    // Publication
    // ---------------------------------------------------------------------

    fn publish(&mut self, out: &mut Outbox) {
        if !self.joined {
            return;
        }
        if let Some(me) = self.gossip.member(&self.self_node) {
            if me.status == MemberStatus::Down && !self.self_downed {
                warn!(node = %self.self_node, "this node has been downed");
                self.self_downed = true;
                out.event(ClusterEvent::SelfDowned);
            }
        } else if self.gossip.is_tombstoned(&self.self_node) {
            self.mark_removed();
        }

        let unreachable = self.unreachable();
        let converged = self.gossip.converged(&unreachable);
        let state = ClusterState::new(
            self.self_node.clone(),
            self.gossip.members().to_vec(),
            unreachable,
            converged,
            self.version,
        );
        let previous = self.published.clone();
        if let Some(prev) = &previous {
            let same = prev.members == state.members
                && prev.unreachable == state.unreachable
                && prev.converged == state.converged;
            if same {
                return;
            }
        }

        self.version = self.version.next();
        let state = Arc::new(ClusterState {
            version: self.version,
            ..state
        });
        self.emit_diff(previous.as_deref(), &state, out);
        if self.self_removed && previous.as_ref().map_or(true, |p| p.self_member().is_some()) {
            out.event(ClusterEvent::SelfRemoved);
        }
        self.published = Some(state.clone());
        out.local(LocalEvent::MembershipChanged(state));
    }

    fn emit_diff(&self, previous: Option<&ClusterState>, state: &ClusterState, out: &mut Outbox) {
        for member in &state.members {
            let before = previous.and_then(|p| p.status_of(&member.node));
            if before != Some(member.status) {
                out.event(ClusterEvent::MemberStatusChanged {
                    node: member.node.clone(),
                    status: member.status,
                });
            }
        }
        if let Some(prev) = previous {
            for member in &prev.members {
                if state.member(&member.node).is_none() {
                    out.event(ClusterEvent::MemberRemoved {
                        node: member.node.clone(),
                    });
                }
            }
            for node in state.unreachable.difference(&prev.unreachable) {
                out.event(ClusterEvent::Unreachable { node: node.clone() });
            }
            for node in prev.unreachable.difference(&state.unreachable) {
                out.event(ClusterEvent::Reachable { node: node.clone() });
            }
        } else {
            for node in &state.unreachable {
                out.event(ClusterEvent::Unreachable { node: node.clone() });
            }
        }
        if previous.map(|p| &p.leader) != Some(&state.leader) {
            if let Some(leader) = &state.leader {
                info!(node = %self.self_node, leader = %leader, "leader changed");
            }
            out.event(ClusterEvent::LeaderChanged {
                leader: state.leader.clone(),
            });
        }
    }
}

impl Component for MembershipService {
    fn id(&self) -> ComponentId {
        ComponentId::Membership
    }

    fn handle(&mut self, now: Duration, input: Input, out: &mut Outbox) {
        if self.stopped() {
            return;
        }
        match input {
            Input::Tick => {
                if !self.joined {
                    self.join_tick(now, out);
                } else {
                    self.heartbeat_tick(now, out);
                    self.gossip_tick(now, out);
                    self.leader_actions_tick(now, out);
                }
            }
            Input::Remote {
                from,
                message: ClusterMessage::Membership(message),
            } => match message {
                MembershipMessage::Join { roles } => self.on_join(from, roles, out),
                MembershipMessage::Welcome { gossip } => self.on_welcome(from, gossip),
                MembershipMessage::Gossip { to, gossip } => {
                    if to == self.self_node {
                        self.on_gossip(from, gossip, out);
                    }
                }
                MembershipMessage::GossipStatus { to, version } => {
                    if to == self.self_node {
                        self.on_gossip_status(from, version, out);
                    }
                }
                MembershipMessage::Heartbeat { to, sequence } => {
                    if to == self.self_node {
                        out.send(
                            &from,
                            ClusterMessage::Membership(MembershipMessage::HeartbeatRsp { sequence }),
                        );
                    }
                }
                MembershipMessage::HeartbeatRsp { .. } => self.heartbeat.on_response(now, &from),
            },
            Input::Remote { .. } => {}
            Input::Local(LocalEvent::DownMembers(nodes)) => self.on_down(nodes),
            Input::Local(LocalEvent::Leave) => self.leave_requested = true,
            Input::Local(LocalEvent::Drained(id)) => {
                self.drained.insert(id);
            }
            Input::Local(_) => {}
        }
        self.try_leave();
        self.check_ready_to_exit();
        self.publish(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Effect;
    use crate::NodeAddress;

    fn node(port: u16) -> UniqueAddress {
        UniqueAddress::new(NodeAddress::new("127.0.0.1", port), 1)
    }

    fn service(port: u16, seeds: &[u16]) -> MembershipService {
        let mut settings = ClusterSettings::for_simulation();
        settings.seed_nodes = seeds
            .iter()
            .map(|p| NodeAddress::new("127.0.0.1", *p))
            .collect();
        MembershipService::new(settings, node(port), BTreeSet::new())
    }

    fn sends(out: &mut Outbox) -> Vec<(NodeAddress, ClusterMessage)> {
        out.drain()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Send { to, message } => Some((to, message)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_node_without_seeds_becomes_up_and_leader() {
        let mut svc = service(1, &[]);
        let mut out = Outbox::new();
        svc.handle(Duration::ZERO, Input::Tick, &mut out);
        svc.handle(Duration::from_millis(10), Input::Tick, &mut out);
        svc.handle(Duration::from_millis(200), Input::Tick, &mut out);

        let state = svc.state().expect("published");
        assert_eq!(state.self_status(), MemberStatus::Up);
        assert!(state.is_leader());
        assert_eq!(state.oldest, Some(node(1)));
        assert_eq!(state.self_member().and_then(|m| m.ordinal), Some(1));
    }

    #[test]
    fn test_joiner_sends_join_to_seeds() {
        let mut svc = service(2, &[1]);
        let mut out = Outbox::new();
        svc.handle(Duration::ZERO, Input::Tick, &mut out);
        let sent = sends(&mut out);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, NodeAddress::new("127.0.0.1", 1));
        assert!(matches!(
            sent[0].1,
            ClusterMessage::Membership(MembershipMessage::Join { .. })
        ));
    }

    #[test]
    fn test_seed_admits_joiner_and_welcome_joins_it() {
        let mut seed = service(1, &[]);
        let mut out = Outbox::new();
        seed.handle(Duration::ZERO, Input::Tick, &mut out);
        out.drain();

        seed.handle(
            Duration::from_millis(5),
            Input::Remote {
                from: node(2),
                message: ClusterMessage::Membership(MembershipMessage::Join {
                    roles: BTreeSet::new(),
                }),
            },
            &mut out,
        );
        let welcome = sends(&mut out)
            .into_iter()
            .find_map(|(_, m)| match m {
                ClusterMessage::Membership(MembershipMessage::Welcome { gossip }) => Some(gossip),
                _ => None,
            })
            .expect("welcome sent");
        assert_eq!(
            welcome.member(&node(2)).map(|m| m.status),
            Some(MemberStatus::Joining)
        );

        let mut joiner = service(2, &[1]);
        joiner.handle(
            Duration::from_millis(6),
            Input::Remote {
                from: node(1),
                message: ClusterMessage::Membership(MembershipMessage::Welcome { gossip: welcome }),
            },
            &mut out,
        );
        let state = joiner.state().expect("published after welcome");
        assert_eq!(state.members.len(), 2);
    }

    #[test]
    fn test_join_from_new_incarnation_downs_previous() {
        let mut seed = service(1, &[]);
        let mut out = Outbox::new();
        seed.handle(Duration::ZERO, Input::Tick, &mut out);
        let join = |svc: &mut MembershipService, from: UniqueAddress, out: &mut Outbox| {
            svc.handle(
                Duration::from_millis(5),
                Input::Remote {
                    from,
                    message: ClusterMessage::Membership(MembershipMessage::Join {
                        roles: BTreeSet::new(),
                    }),
                },
                out,
            );
        };
        join(&mut seed, node(2), &mut out);
        out.drain();

        let reborn = node(2).next_incarnation();
        join(&mut seed, reborn.clone(), &mut out);
        let welcomed = sends(&mut out).into_iter().any(|(_, m)| {
            matches!(m, ClusterMessage::Membership(MembershipMessage::Welcome { .. }))
        });
        assert!(!welcomed, "new incarnation must wait for the old one to be removed");
        assert_eq!(
            seed.gossip().member(&node(2)).map(|m| m.status),
            Some(MemberStatus::Down)
        );
        assert!(seed.gossip().member(&reborn).is_none());
    }

    #[test]
    fn test_down_members_marks_self_downed() {
        let mut svc = service(1, &[]);
        let mut out = Outbox::new();
        svc.handle(Duration::ZERO, Input::Tick, &mut out);
        out.drain();
        svc.handle(
            Duration::from_millis(1),
            Input::Local(LocalEvent::DownMembers(vec![node(1)])),
            &mut out,
        );
        let events = out.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, Effect::Event(ClusterEvent::SelfDowned))));
        assert_eq!(
            svc.state().map(|s| s.self_status()),
            Some(MemberStatus::Down)
        );
    }

    #[test]
    fn test_leave_requires_drain_before_ready_to_exit() {
        let mut settings = ClusterSettings::for_simulation();
        settings.seed_nodes.clear();
        let participants = BTreeSet::from([ComponentId::Region("cart".to_string())]);
        let mut svc = MembershipService::new(settings, node(1), participants);
        let mut out = Outbox::new();
        svc.handle(Duration::ZERO, Input::Tick, &mut out);
        svc.handle(Duration::from_millis(200), Input::Tick, &mut out);
        svc.handle(Duration::from_millis(201), Input::Local(LocalEvent::Leave), &mut out);
        let me = svc.gossip().member(&node(1)).cloned().expect("member");
        assert_eq!(me.status, MemberStatus::Leaving);
        assert!(!me.ready_to_exit);

        svc.handle(
            Duration::from_millis(202),
            Input::Local(LocalEvent::Drained(ComponentId::Region("cart".to_string()))),
            &mut out,
        );
        assert!(svc.gossip().member(&node(1)).is_some_and(|m| m.ready_to_exit));
    }
}
