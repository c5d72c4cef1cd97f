//! The shard coordinator.
//!
//! One coordinator per entity type is active in the cluster at a time: it is
//! hosted as a cluster singleton and only works between the manager's
//! [`LocalEvent::InstanceStart`] and [`LocalEvent::InstanceStop`]. A freshly
//! activated coordinator knows nothing; it rebuilds the table from region
//! registrations and does not allocate new shards until every region that
//! could host one has registered, so a shard still alive on an unregistered
//! region is never allocated twice.
//!
//! Handoff of a shard from `from` to `to`:
//!
//! ```text
//!  coordinator ── BeginHandOff ──▶ every region   (drop home, buffer)
//!  coordinator ◀── BeginHandOffAck ── every region
//!  coordinator ── HandOff ──▶ from                 (passivate entities)
//!  coordinator ◀── ShardStopped ── from
//!  coordinator ── ShardHome(to) ──▶ every region   (flush buffers)
//! ```
//!
//! Each step is retried every `handoff_timeout`, at most `handoff_retries`
//! times; after that the shard stays with `from` and is blocked until `from`
//! leaves the cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::allocation::{Ownership, ShardAllocationStrategy};
use super::table::{HandoffInProgress, ShardTable};
use super::ShardId;
use crate::component::{Component, ComponentId, Input, LocalEvent, Outbox};
use crate::config::ShardingSettings;
use crate::events::ClusterEvent;
use crate::membership::{ClusterState, MemberStatus};
use crate::protocol::{ClusterMessage, ShardingMessage};
use crate::UniqueAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
enum HandoffStep {
    /// Waiting for `BeginHandOffAck` from these regions.
    Begin { pending: BTreeSet<UniqueAddress> },
    /// Waiting for `ShardStopped` from the source.
    Stopping,
}

#[derive(Debug, Clone)]
struct Handoff {
    from: UniqueAddress,
    to: UniqueAddress,
    step: HandoffStep,
    deadline: Duration,
    retries: u32,
}

/// Shard coordinator component for one entity type.
pub struct ShardCoordinator {
    type_name: String,
    singleton_name: String,
    settings: ShardingSettings,
    self_node: UniqueAddress,
    strategy: Box<dyn ShardAllocationStrategy>,
    state: Option<Arc<ClusterState>>,
    generation: Option<u64>,
    /// Registered regions and whether they host entities.
    regions: BTreeMap<UniqueAddress, bool>,
    shards: BTreeMap<ShardId, UniqueAddress>,
    handoffs: BTreeMap<ShardId, Handoff>,
    blocked: BTreeSet<ShardId>,
    last_rebalance: Option<Duration>,
}

impl ShardCoordinator {
    /// Create an inactive coordinator. `singleton_name` is the name the
    /// singleton manager starts and stops it under.
    pub fn new(
        type_name: impl Into<String>,
        singleton_name: impl Into<String>,
        settings: ShardingSettings,
        self_node: UniqueAddress,
        strategy: Box<dyn ShardAllocationStrategy>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            singleton_name: singleton_name.into(),
            settings,
            self_node,
            strategy,
            state: None,
            generation: None,
            regions: BTreeMap::new(),
            shards: BTreeMap::new(),
            handoffs: BTreeMap::new(),
            blocked: BTreeSet::new(),
            last_rebalance: None,
        }
    }

    /// Whether this coordinator is the active one.
    pub fn is_active(&self) -> bool {
        self.generation.is_some()
    }

    /// Current table.
    pub fn table(&self) -> ShardTable {
        ShardTable {
            type_name: self.type_name.clone(),
            coordinator: self.self_node.clone(),
            generation: self.generation.unwrap_or(0),
            active: self.is_active(),
            shards: self.shards.clone(),
            handoffs: self
                .handoffs
                .iter()
                .map(|(shard, h)| {
                    (
                        shard.clone(),
                        HandoffInProgress {
                            from: h.from.clone(),
                            to: h.to.clone(),
                        },
                    )
                })
                .collect(),
            blocked: self.blocked.clone(),
        }
    }

    fn publish(&self, out: &mut Outbox) {
        out.local(LocalEvent::ShardTableChanged(Arc::new(self.table())));
    }

    fn send(&self, to: &UniqueAddress, message: ShardingMessage, out: &mut Outbox) {
        out.send(
            to,
            ClusterMessage::Sharding {
                type_name: self.type_name.clone(),
                message,
            },
        );
    }

    fn broadcast(&self, message: &ShardingMessage, out: &mut Outbox) {
        for region in self.regions.keys() {
            self.send(region, message.clone(), out);
        }
    }

    fn status_of(&self, node: &UniqueAddress) -> Option<MemberStatus> {
        self.state.as_ref().and_then(|s| s.status_of(node))
    }

    fn is_alive(&self, node: &UniqueAddress) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_alive(node))
    }

    /// Hosting regions that can be given shards (`Up`) or must give them
    /// away (`Leaving`), with the shards they own.
    fn ownership(&self) -> (Ownership, BTreeSet<UniqueAddress>) {
        let mut ownership = Ownership::new();
        let mut leaving = BTreeSet::new();
        for (region, hosting) in &self.regions {
            match self.status_of(region) {
                Some(MemberStatus::Up) if *hosting => {
                    ownership.insert(region.clone(), Vec::new());
                }
                Some(MemberStatus::Leaving | MemberStatus::Exiting) if *hosting => {
                    ownership.insert(region.clone(), Vec::new());
                    leaving.insert(region.clone());
                }
                _ => {}
            }
        }
        for (shard, owner) in &self.shards {
            if let Some(shards) = ownership.get_mut(owner) {
                shards.push(shard.clone());
            }
        }
        (ownership, leaving)
    }

    /// Every member able to host has registered its region.
    fn all_registered(&self) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        state
            .members
            .iter()
            .filter(|m| matches!(m.status, MemberStatus::Up | MemberStatus::Leaving))
            .filter(|m| m.has_role(self.settings.role.as_deref()))
            .all(|m| self.regions.get(&m.node) == Some(&true))
    }

    fn activate(&mut self, generation: u64, out: &mut Outbox) {
        info!(
            node = %self.self_node,
            type_name = %self.type_name,
            generation,
            "shard coordinator activated"
        );
        self.generation = Some(generation);
        self.regions.clear();
        self.shards.clear();
        self.handoffs.clear();
        self.blocked.clear();
        self.last_rebalance = None;
        self.publish(out);
    }

    fn deactivate(&mut self, out: &mut Outbox) {
        if self.generation.is_some() {
            info!(node = %self.self_node, type_name = %self.type_name, "shard coordinator stopped");
            self.publish_inactive(out);
        }
        self.generation = None;
        self.regions.clear();
        self.shards.clear();
        self.handoffs.clear();
        self.blocked.clear();
        out.local(LocalEvent::InstanceStopped {
            name: self.singleton_name.clone(),
        });
    }

    fn publish_inactive(&self, out: &mut Outbox) {
        let mut table = self.table();
        table.active = false;
        out.local(LocalEvent::ShardTableChanged(Arc::new(table)));
    }

    // ---------------------------------------------------------------------
    // Region requests
    // ---------------------------------------------------------------------

    fn on_register(
        &mut self,
        from: UniqueAddress,
        shards: Vec<ShardId>,
        hosting: bool,
        out: &mut Outbox,
    ) {
        if !self.is_alive(&from) {
            debug!(region = %from, "ignoring registration from non-member");
            return;
        }
        if self.regions.insert(from.clone(), hosting).is_none() {
            info!(type_name = %self.type_name, region = %from, hosting, "region registered");
        }
        let mut changed = false;
        for shard in shards {
            match self.shards.get(&shard) {
                None => {
                    debug!(shard = %shard, region = %from, "region reclaims hosted shard");
                    self.shards.insert(shard, from.clone());
                    changed = true;
                }
                Some(owner) if *owner == from => {}
                Some(owner) => {
                    warn!(
                        shard = %shard,
                        owner = %owner,
                        duplicate = %from,
                        "shard reported by two regions, keeping first owner"
                    );
                    self.send(&from, ShardingMessage::HandOff { shard }, out);
                }
            }
        }
        self.send(&from, ShardingMessage::RegisterAck, out);
        if changed {
            self.publish(out);
        }
    }

    fn on_get_shard_home(&mut self, from: UniqueAddress, shard: ShardId, out: &mut Outbox) {
        if !self.regions.contains_key(&from) || self.handoffs.contains_key(&shard) {
            return;
        }
        if let Some(owner) = self.shards.get(&shard) {
            let region = owner.clone();
            self.send(&from, ShardingMessage::ShardHome { shard, region }, out);
            return;
        }
        if !self.all_registered() {
            debug!(shard = %shard, "deferring allocation until every region registered");
            return;
        }
        let (ownership, leaving) = self.ownership();
        let Some(region) = self.strategy.allocate(&shard, &ownership, &leaving) else {
            debug!(shard = %shard, "no region available for allocation");
            return;
        };
        self.allocate(shard.clone(), region.clone(), out);
        if region != from {
            self.send(&from, ShardingMessage::ShardHome { shard, region }, out);
        }
        self.publish(out);
    }

    /// Record ownership and tell the owner.
    fn allocate(&mut self, shard: ShardId, region: UniqueAddress, out: &mut Outbox) {
        info!(type_name = %self.type_name, shard = %shard, region = %region, "shard allocated");
        self.shards.insert(shard.clone(), region.clone());
        out.event(ClusterEvent::ShardAllocated {
            type_name: self.type_name.clone(),
            shard: shard.clone(),
            region: region.clone(),
        });
        self.send(&region, ShardingMessage::ShardHome { shard, region: region.clone() }, out);
    }

    // ---------------------------------------------------------------------
    // Handoff
    // ---------------------------------------------------------------------

    fn start_handoff(&mut self, now: Duration, shard: ShardId, to: UniqueAddress, out: &mut Outbox) {
        let Some(from) = self.shards.get(&shard).cloned() else {
            return;
        };
        info!(type_name = %self.type_name, shard = %shard, from = %from, to = %to, "starting handoff");
        out.event(ClusterEvent::HandoffStarted {
            type_name: self.type_name.clone(),
            shard: shard.clone(),
            from: from.clone(),
            to: to.clone(),
        });
        let pending: BTreeSet<UniqueAddress> = self.regions.keys().cloned().collect();
        self.broadcast(&ShardingMessage::BeginHandOff { shard: shard.clone() }, out);
        self.handoffs.insert(
            shard,
            Handoff {
                from,
                to,
                step: HandoffStep::Begin { pending },
                deadline: now + self.settings.handoff_timeout,
                retries: 0,
            },
        );
    }

    fn on_begin_ack(&mut self, now: Duration, from: UniqueAddress, shard: ShardId, out: &mut Outbox) {
        let Some(handoff) = self.handoffs.get_mut(&shard) else {
            return;
        };
        if let HandoffStep::Begin { pending } = &mut handoff.step {
            pending.remove(&from);
        }
        self.advance(now, &shard, out);
    }

    /// Move a handoff whose acks are all in to the stopping step.
    fn advance(&mut self, now: Duration, shard: &ShardId, out: &mut Outbox) {
        let Some(handoff) = self.handoffs.get_mut(shard) else {
            return;
        };
        let acked = matches!(&handoff.step, HandoffStep::Begin { pending } if pending.is_empty());
        if !acked {
            return;
        }
        debug!(shard = %shard, from = %handoff.from, "all regions acked, handing off");
        handoff.step = HandoffStep::Stopping;
        handoff.deadline = now + self.settings.handoff_timeout;
        handoff.retries = 0;
        let from = handoff.from.clone();
        self.send(&from, ShardingMessage::HandOff { shard: shard.clone() }, out);
    }

    fn on_shard_stopped(&mut self, from: UniqueAddress, shard: ShardId, out: &mut Outbox) {
        let Some(handoff) = self.handoffs.get(&shard) else {
            // stop of a duplicate told to hand off; ownership is unchanged
            return;
        };
        if handoff.from != from {
            return;
        }
        let intended = handoff.to.clone();
        self.handoffs.remove(&shard);
        self.shards.remove(&shard);

        let (ownership, leaving) = self.ownership();
        let target = if ownership.contains_key(&intended) && !leaving.contains(&intended) {
            Some(intended)
        } else {
            self.strategy.allocate(&shard, &ownership, &leaving)
        };
        match target {
            Some(to) => {
                info!(type_name = %self.type_name, shard = %shard, to = %to, "handoff completed");
                out.event(ClusterEvent::HandoffCompleted {
                    type_name: self.type_name.clone(),
                    shard: shard.clone(),
                    to: to.clone(),
                });
                self.allocate(shard.clone(), to.clone(), out);
                self.broadcast(&ShardingMessage::ShardHome { shard, region: to }, out);
            }
            None => {
                // left unallocated; the next GetShardHome allocates it
                warn!(shard = %shard, "handoff completed without a target region");
            }
        }
        self.publish(out);
    }

    fn check_handoff_timeouts(&mut self, now: Duration, out: &mut Outbox) {
        let expired: Vec<ShardId> = self
            .handoffs
            .iter()
            .filter(|(_, h)| h.deadline <= now)
            .map(|(shard, _)| shard.clone())
            .collect();
        for shard in expired {
            let Some(handoff) = self.handoffs.get_mut(&shard) else {
                continue;
            };
            handoff.retries += 1;
            if handoff.retries > self.settings.handoff_retries {
                let from = handoff.from.clone();
                warn!(
                    type_name = %self.type_name,
                    shard = %shard,
                    owner = %from,
                    "handoff failed after retries, blocking shard"
                );
                self.handoffs.remove(&shard);
                self.blocked.insert(shard.clone());
                out.event(ClusterEvent::HandoffFailed {
                    type_name: self.type_name.clone(),
                    shard: shard.clone(),
                    from: from.clone(),
                });
                self.broadcast(&ShardingMessage::ShardHome { shard, region: from }, out);
                self.publish(out);
                continue;
            }
            handoff.deadline = now + self.settings.handoff_timeout;
            debug!(shard = %shard, retry = handoff.retries, "retrying handoff step");
            match handoff.step.clone() {
                HandoffStep::Begin { pending } => {
                    for region in pending {
                        self.send(&region, ShardingMessage::BeginHandOff { shard: shard.clone() }, out);
                    }
                }
                HandoffStep::Stopping => {
                    let from = handoff.from.clone();
                    self.send(&from, ShardingMessage::HandOff { shard }, out);
                }
            }
        }
    }

    fn rebalance_tick(&mut self, now: Duration, out: &mut Outbox) {
        let due = self.last_rebalance.map_or(true, |last| {
            now.saturating_sub(last) >= self.settings.rebalance_interval
        });
        if !due {
            return;
        }
        self.last_rebalance = Some(now);
        if !self.all_registered() {
            return;
        }
        let budget = self
            .settings
            .handoff_concurrency
            .saturating_sub(self.handoffs.len());
        let excluded: BTreeSet<ShardId> = self
            .handoffs
            .keys()
            .chain(self.blocked.iter())
            .cloned()
            .collect();
        let (mut ownership, leaving) = self.ownership();
        // count shards in flight at their destination
        for (shard, handoff) in &self.handoffs {
            if let Some(shards) = ownership.get_mut(&handoff.from) {
                shards.retain(|s| s != shard);
            }
            if let Some(shards) = ownership.get_mut(&handoff.to) {
                shards.push(shard.clone());
            }
        }
        let moves = self.strategy.rebalance(&ownership, &leaving, &excluded, budget);
        if moves.is_empty() {
            return;
        }
        for (shard, to) in moves {
            self.start_handoff(now, shard, to, out);
        }
        self.publish(out);
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    fn on_membership(&mut self, now: Duration, state: Arc<ClusterState>, out: &mut Outbox) {
        self.state = Some(state);
        if !self.is_active() {
            return;
        }
        let gone: Vec<UniqueAddress> = self
            .regions
            .keys()
            .filter(|r| !self.is_alive(r))
            .cloned()
            .collect();
        if gone.is_empty() {
            return;
        }
        for region in &gone {
            self.regions.remove(region);
            let lost: Vec<ShardId> = self
                .shards
                .iter()
                .filter(|(_, owner)| *owner == region)
                .map(|(shard, _)| shard.clone())
                .collect();
            if !lost.is_empty() {
                // entities of a downed region are lost; the shard restarts empty
                warn!(
                    type_name = %self.type_name,
                    region = %region,
                    shards = lost.len(),
                    "deallocating shards of removed region"
                );
            }
            for shard in lost {
                self.shards.remove(&shard);
                self.blocked.remove(&shard);
                self.handoffs.remove(&shard);
            }
            let mut acked = Vec::new();
            for (shard, handoff) in self.handoffs.iter_mut() {
                if let HandoffStep::Begin { pending } = &mut handoff.step {
                    if pending.remove(region) {
                        acked.push(shard.clone());
                    }
                }
            }
            for shard in acked {
                self.advance(now, &shard, out);
            }
        }
        self.publish(out);
    }
}

impl Component for ShardCoordinator {
    fn id(&self) -> ComponentId {
        ComponentId::Coordinator(self.type_name.clone())
    }

    fn handle(&mut self, now: Duration, input: Input, out: &mut Outbox) {
        match input {
            Input::Local(LocalEvent::InstanceStart { name, generation })
                if name == self.singleton_name =>
            {
                self.activate(generation, out);
            }
            Input::Local(LocalEvent::InstanceStop { name }) if name == self.singleton_name => {
                self.deactivate(out);
            }
            Input::Local(LocalEvent::MembershipChanged(state)) => {
                self.on_membership(now, state, out);
            }
            Input::Remote {
                from,
                message: ClusterMessage::Sharding { message, .. },
            } if self.is_active() => match message {
                ShardingMessage::Register { shards, hosting } => {
                    self.on_register(from, shards, hosting, out);
                }
                ShardingMessage::GetShardHome { shard } => self.on_get_shard_home(from, shard, out),
                ShardingMessage::BeginHandOffAck { shard } => {
                    self.on_begin_ack(now, from, shard, out);
                }
                ShardingMessage::ShardStopped { shard } => self.on_shard_stopped(from, shard, out),
                _ => {}
            },
            Input::Tick if self.is_active() => {
                self.check_handoff_timeouts(now, out);
                self.rebalance_tick(now, out);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Effect;
    use crate::membership::{Member, MembershipVersion};
    use crate::sharding::EvenShardAllocation;
    use crate::NodeAddress;

    fn node(port: u16) -> UniqueAddress {
        UniqueAddress::new(NodeAddress::new("127.0.0.1", port), 1)
    }

    fn state(members: &[(u16, MemberStatus)]) -> Arc<ClusterState> {
        let members = members
            .iter()
            .map(|(p, status)| {
                let mut m = Member::joining(node(*p), BTreeSet::new());
                m.status = *status;
                m.ordinal = Some(u64::from(*p));
                m
            })
            .collect();
        Arc::new(ClusterState::new(
            node(1),
            members,
            BTreeSet::new(),
            true,
            MembershipVersion(1),
        ))
    }

    fn coordinator(members: &[(u16, MemberStatus)]) -> (ShardCoordinator, Outbox) {
        let settings = ShardingSettings::for_simulation();
        let mut c = ShardCoordinator::new(
            "cart",
            "cart-coordinator",
            settings,
            node(1),
            Box::new(EvenShardAllocation::new(1)),
        );
        let mut out = Outbox::new();
        c.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::MembershipChanged(state(members))),
            &mut out,
        );
        c.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::InstanceStart {
                name: "cart-coordinator".into(),
                generation: 1,
            }),
            &mut out,
        );
        out.drain();
        (c, out)
    }

    fn remote(from: u16, message: ShardingMessage) -> Input {
        Input::Remote {
            from: node(from),
            message: ClusterMessage::Sharding {
                type_name: "cart".into(),
                message,
            },
        }
    }

    fn sent(out: &mut Outbox) -> Vec<(u16, ShardingMessage)> {
        out.drain()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Send {
                    to,
                    message: ClusterMessage::Sharding { message, .. },
                } => Some((to.port(), message)),
                _ => None,
            })
            .collect()
    }

    fn register(c: &mut ShardCoordinator, out: &mut Outbox, from: u16, shards: &[u32]) {
        c.handle(
            Duration::ZERO,
            remote(
                from,
                ShardingMessage::Register {
                    shards: shards.iter().map(|s| ShardId::from(*s)).collect(),
                    hosting: true,
                },
            ),
            out,
        );
    }

    #[test]
    fn test_allocation_waits_for_every_region() {
        let (mut c, mut out) = coordinator(&[(1, MemberStatus::Up), (2, MemberStatus::Up)]);
        register(&mut c, &mut out, 1, &[]);
        out.drain();

        c.handle(
            Duration::ZERO,
            remote(1, ShardingMessage::GetShardHome { shard: ShardId::from(3) }),
            &mut out,
        );
        assert!(sent(&mut out).is_empty());

        register(&mut c, &mut out, 2, &[]);
        out.drain();
        c.handle(
            Duration::ZERO,
            remote(2, ShardingMessage::GetShardHome { shard: ShardId::from(3) }),
            &mut out,
        );
        let msgs = sent(&mut out);
        assert!(msgs.contains(&(
            1,
            ShardingMessage::ShardHome {
                shard: ShardId::from(3),
                region: node(1)
            }
        )));
        assert_eq!(c.table().owner(&ShardId::from(3)), Some(&node(1)));
    }

    #[test]
    fn test_duplicate_report_keeps_first_owner() {
        let (mut c, mut out) = coordinator(&[(1, MemberStatus::Up), (2, MemberStatus::Up)]);
        register(&mut c, &mut out, 1, &[4]);
        out.drain();
        register(&mut c, &mut out, 2, &[4]);
        let msgs = sent(&mut out);
        assert!(msgs.contains(&(2, ShardingMessage::HandOff { shard: ShardId::from(4) })));
        assert_eq!(c.table().owner(&ShardId::from(4)), Some(&node(1)));
    }

    #[test]
    fn test_handoff_protocol_moves_shard() {
        let (mut c, mut out) = coordinator(&[(1, MemberStatus::Up), (2, MemberStatus::Up)]);
        register(&mut c, &mut out, 1, &[0, 1]);
        register(&mut c, &mut out, 2, &[]);
        out.drain();

        c.handle(Duration::from_secs(1), Input::Tick, &mut out);
        let msgs = sent(&mut out);
        let begins: Vec<_> = msgs
            .iter()
            .filter(|(_, m)| matches!(m, ShardingMessage::BeginHandOff { .. }))
            .collect();
        assert_eq!(begins.len(), 2);
        let shard = ShardId::from(1);
        assert!(c.table().handoffs.contains_key(&shard));

        for region in [1, 2] {
            c.handle(
                Duration::from_secs(1),
                remote(region, ShardingMessage::BeginHandOffAck { shard: shard.clone() }),
                &mut out,
            );
        }
        assert!(sent(&mut out).contains(&(1, ShardingMessage::HandOff { shard: shard.clone() })));

        c.handle(
            Duration::from_secs(1),
            remote(1, ShardingMessage::ShardStopped { shard: shard.clone() }),
            &mut out,
        );
        assert_eq!(c.table().owner(&shard), Some(&node(2)));
        assert!(c.table().handoffs.is_empty());
        let events: Vec<_> = out
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Event(ev) => Some(ev),
                _ => None,
            })
            .collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, ClusterEvent::HandoffCompleted { to, .. } if *to == node(2))));
    }

    #[test]
    fn test_handoff_blocked_after_retries() {
        let (mut c, mut out) = coordinator(&[(1, MemberStatus::Up), (2, MemberStatus::Up)]);
        register(&mut c, &mut out, 1, &[0, 1]);
        register(&mut c, &mut out, 2, &[]);
        c.handle(Duration::from_secs(1), Input::Tick, &mut out);
        out.drain();

        // no acks ever arrive; handoff_timeout is 1s, 3 retries
        for secs in 2..=6 {
            c.handle(Duration::from_secs(secs), Input::Tick, &mut out);
        }
        let table = c.table();
        assert!(table.blocked.contains(&ShardId::from(1)));
        assert_eq!(table.owner(&ShardId::from(1)), Some(&node(1)));
        assert!(out.drain().iter().any(|e| matches!(
            e,
            Effect::Event(ClusterEvent::HandoffFailed { from, .. }) if *from == node(1)
        )));
    }

    #[test]
    fn test_downed_region_shards_are_deallocated() {
        let (mut c, mut out) = coordinator(&[(1, MemberStatus::Up), (2, MemberStatus::Up)]);
        register(&mut c, &mut out, 1, &[0]);
        register(&mut c, &mut out, 2, &[1]);
        out.drain();
        c.handle(
            Duration::from_secs(1),
            Input::Local(LocalEvent::MembershipChanged(state(&[
                (1, MemberStatus::Up),
                (2, MemberStatus::Down),
            ]))),
            &mut out,
        );
        let table = c.table();
        assert_eq!(table.owner(&ShardId::from(1)), None);
        assert_eq!(table.owner(&ShardId::from(0)), Some(&node(1)));
    }

    #[test]
    fn test_stop_reports_instance_stopped() {
        let (mut c, mut out) = coordinator(&[(1, MemberStatus::Up)]);
        c.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::InstanceStop {
                name: "cart-coordinator".into(),
            }),
            &mut out,
        );
        assert!(!c.is_active());
        assert!(out.drain().iter().any(|e| matches!(
            e,
            Effect::Local(LocalEvent::InstanceStopped { name }) if name == "cart-coordinator"
        )));
    }
}
