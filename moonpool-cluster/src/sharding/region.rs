//! The shard region.
//!
//! Every node runs one region per entity type. A region hosts the entities
//! of the shards the coordinator allocated to it and routes every other
//! message to the owning region, asking the coordinator for shard homes it
//! does not know yet. Messages whose shard has no known home wait in a
//! bounded buffer; past `buffer_size` buffered messages, new ones are
//! rejected with [`RouteOutcome::Unavailable`].
//!
//! A node without the configured sharding role runs its region in proxy
//! mode: it routes but never hosts.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::entity::{Entity, EntityContext, EntityFactory};
use super::ShardId;
use crate::component::{Component, ComponentId, Input, LocalEvent, Outbox};
use crate::config::ShardingSettings;
use crate::events::ClusterEvent;
use crate::membership::{ClusterState, MemberStatus};
use crate::protocol::{ClusterMessage, EntityEnvelope, RouteOutcome, ShardingMessage};
use crate::UniqueAddress;

/// Region-to-region forwards allowed before a message is rejected.
pub const MAX_HOPS: u8 = 2;

struct EntityInstance {
    entity: Box<dyn Entity>,
    shard: ShardId,
    last_active: Duration,
}

/// Shard region component for one entity type.
pub struct ShardRegion {
    type_name: String,
    settings: ShardingSettings,
    self_node: UniqueAddress,
    factory: EntityFactory,
    can_host: bool,
    state: Option<Arc<ClusterState>>,
    coordinator: Option<UniqueAddress>,
    registered: bool,
    last_register: Option<Duration>,
    homes: BTreeMap<ShardId, UniqueAddress>,
    hosted: BTreeSet<ShardId>,
    entities: BTreeMap<String, EntityInstance>,
    buffers: BTreeMap<ShardId, VecDeque<EntityEnvelope>>,
    buffered: usize,
    requested: BTreeMap<ShardId, Duration>,
    drained: bool,
    stopped: bool,
}

impl ShardRegion {
    /// Create a region. `roles` are the roles of this node; the region hosts
    /// entities only when they include the sharding role (if one is set).
    pub fn new(
        type_name: impl Into<String>,
        settings: ShardingSettings,
        self_node: UniqueAddress,
        roles: &BTreeSet<String>,
        factory: EntityFactory,
    ) -> Self {
        let can_host = settings.role.as_ref().map_or(true, |r| roles.contains(r));
        Self {
            type_name: type_name.into(),
            settings,
            self_node,
            factory,
            can_host,
            state: None,
            coordinator: None,
            registered: false,
            last_register: None,
            homes: BTreeMap::new(),
            hosted: BTreeSet::new(),
            entities: BTreeMap::new(),
            buffers: BTreeMap::new(),
            buffered: 0,
            requested: BTreeMap::new(),
            drained: false,
            stopped: false,
        }
    }

    /// Shards hosted here.
    pub fn hosted_shards(&self) -> &BTreeSet<ShardId> {
        &self.hosted
    }

    /// Ids of live entities.
    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Number of buffered messages.
    pub fn buffered(&self) -> usize {
        self.buffered
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

    fn reply(envelope: &EntityEnvelope, outcome: RouteOutcome, out: &mut Outbox) {
        if envelope.expects_reply {
            out.send(
                &envelope.id.origin,
                ClusterMessage::Reply {
                    to: envelope.id.origin.clone(),
                    request_id: envelope.id.request_id,
                    outcome,
                },
            );
        }
    }

    // ---------------------------------------------------------------------
    // Routing
    // ---------------------------------------------------------------------

    fn route(&mut self, now: Duration, mut envelope: EntityEnvelope, out: &mut Outbox) {
        if self.stopped {
            Self::reply(&envelope, RouteOutcome::Unavailable, out);
            return;
        }
        if self.hosted.contains(&envelope.shard) {
            self.deliver_local(now, envelope, out);
            return;
        }
        match self.homes.get(&envelope.shard) {
            Some(home) if *home != self.self_node => {
                if envelope.hops >= MAX_HOPS {
                    warn!(
                        type_name = %self.type_name,
                        entity_id = %envelope.entity_id,
                        hops = envelope.hops,
                        "too many forwards, rejecting message"
                    );
                    Self::reply(&envelope, RouteOutcome::Unavailable, out);
                    return;
                }
                let home = home.clone();
                envelope.hops += 1;
                self.send(&home, ShardingMessage::Deliver(envelope), out);
            }
            _ => {
                let shard = envelope.shard.clone();
                self.buffer(envelope, out);
                self.request_home(now, &shard, out);
            }
        }
    }

    fn buffer(&mut self, envelope: EntityEnvelope, out: &mut Outbox) {
        if self.buffered >= self.settings.buffer_size {
            warn!(
                type_name = %self.type_name,
                shard = %envelope.shard,
                buffered = self.buffered,
                "region buffer full, rejecting message"
            );
            Self::reply(&envelope, RouteOutcome::Unavailable, out);
            return;
        }
        self.buffered += 1;
        self.buffers
            .entry(envelope.shard.clone())
            .or_default()
            .push_back(envelope);
    }

    fn request_home(&mut self, now: Duration, shard: &ShardId, out: &mut Outbox) {
        if self.requested.contains_key(shard) {
            return;
        }
        self.send_get_home(now, shard, out);
    }

    fn send_get_home(&mut self, now: Duration, shard: &ShardId, out: &mut Outbox) {
        let Some(coordinator) = self.coordinator.clone().filter(|_| self.registered) else {
            return;
        };
        debug!(type_name = %self.type_name, shard = %shard, "requesting shard home");
        self.requested.insert(shard.clone(), now);
        self.send(
            &coordinator,
            ShardingMessage::GetShardHome {
                shard: shard.clone(),
            },
            out,
        );
    }

    fn flush(&mut self, now: Duration, shard: &ShardId, out: &mut Outbox) {
        self.requested.remove(shard);
        let Some(pending) = self.buffers.remove(shard) else {
            return;
        };
        self.buffered -= pending.len();
        debug!(type_name = %self.type_name, shard = %shard, count = pending.len(), "flushing buffered messages");
        for envelope in pending {
            self.route(now, envelope, out);
        }
    }

    fn deliver_local(&mut self, now: Duration, envelope: EntityEnvelope, out: &mut Outbox) {
        let entity_id = envelope.entity_id.clone();
        if !self.entities.contains_key(&entity_id) {
            debug!(type_name = %self.type_name, entity_id = %entity_id, "starting entity");
            self.entities.insert(
                entity_id.clone(),
                EntityInstance {
                    entity: (self.factory)(&entity_id),
                    shard: envelope.shard.clone(),
                    last_active: now,
                },
            );
            out.event(ClusterEvent::EntityStarted {
                type_name: self.type_name.clone(),
                entity_id: entity_id.clone(),
            });
        }
        let Some(instance) = self.entities.get_mut(&entity_id) else {
            return;
        };
        let mut ctx = EntityContext::new(&entity_id);
        let reply = instance.entity.receive(&mut ctx, &envelope.payload);
        instance.last_active = now;

        out.event(ClusterEvent::MessageProcessed {
            type_name: self.type_name.clone(),
            entity_id: entity_id.clone(),
            id: envelope.id.clone(),
        });
        Self::reply(&envelope, RouteOutcome::Success(reply), out);
        if ctx.passivate_requested() {
            self.passivate(&entity_id, out);
        }
    }

    fn passivate(&mut self, entity_id: &str, out: &mut Outbox) {
        if self.entities.remove(entity_id).is_some() {
            debug!(type_name = %self.type_name, entity_id = %entity_id, "passivating entity");
            out.event(ClusterEvent::EntityPassivated {
                type_name: self.type_name.clone(),
                entity_id: entity_id.to_string(),
            });
        }
    }

    fn passivate_shard(&mut self, shard: &ShardId, out: &mut Outbox) {
        let ids: Vec<String> = self
            .entities
            .iter()
            .filter(|(_, e)| e.shard == *shard)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.passivate(&id, out);
        }
    }

    // ---------------------------------------------------------------------
    // Coordinator messages
    // ---------------------------------------------------------------------

    fn register(&mut self, now: Duration, out: &mut Outbox) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        self.last_register = Some(now);
        debug!(type_name = %self.type_name, coordinator = %coordinator, "registering region");
        self.send(
            &coordinator,
            ShardingMessage::Register {
                shards: self.hosted.iter().cloned().collect(),
                hosting: self.can_host,
            },
            out,
        );
    }

    fn on_coordinator_message(
        &mut self,
        now: Duration,
        from: UniqueAddress,
        message: ShardingMessage,
        out: &mut Outbox,
    ) {
        match message {
            ShardingMessage::RegisterAck => {
                if self.coordinator.as_ref() != Some(&from) || self.registered {
                    return;
                }
                info!(type_name = %self.type_name, coordinator = %from, "region registered with coordinator");
                self.registered = true;
                self.requested.clear();
                let waiting: Vec<ShardId> = self.buffers.keys().cloned().collect();
                for shard in waiting {
                    self.send_get_home(now, &shard, out);
                }
            }
            ShardingMessage::ShardHome { shard, region } => {
                if region == self.self_node {
                    if self.can_host && self.hosted.insert(shard.clone()) {
                        info!(type_name = %self.type_name, shard = %shard, "hosting shard");
                    }
                } else if self.hosted.contains(&shard) {
                    // keep serving a shard we host until told to hand it off
                    debug!(shard = %shard, home = %region, "ignoring home for hosted shard");
                    return;
                }
                self.homes.insert(shard.clone(), region);
                self.flush(now, &shard, out);
            }
            ShardingMessage::BeginHandOff { shard } => {
                if !self.hosted.contains(&shard) {
                    self.homes.remove(&shard);
                }
                self.send(&from, ShardingMessage::BeginHandOffAck { shard }, out);
            }
            ShardingMessage::HandOff { shard } => {
                info!(type_name = %self.type_name, shard = %shard, "handing off shard");
                self.passivate_shard(&shard, out);
                self.hosted.remove(&shard);
                self.homes.remove(&shard);
                self.send(&from, ShardingMessage::ShardStopped { shard }, out);
                self.check_drained(out);
            }
            ShardingMessage::Deliver(envelope) => {
                if !self.hosted.contains(&envelope.shard) {
                    debug!(shard = %envelope.shard, from = %from, "stale shard home at sender, re-resolving");
                    self.homes.remove(&envelope.shard);
                }
                self.route(now, envelope, out);
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    fn on_membership(&mut self, now: Duration, state: Arc<ClusterState>, out: &mut Outbox) {
        if matches!(
            state.self_status(),
            MemberStatus::Down | MemberStatus::Removed
        ) {
            self.state = Some(state);
            self.stop(out);
            return;
        }

        let coordinator = state.oldest_with_role(self.settings.role.as_deref());
        let stale: Vec<ShardId> = self
            .homes
            .iter()
            .filter(|(_, region)| !state.is_alive(region))
            .map(|(shard, _)| shard.clone())
            .collect();
        for shard in stale {
            self.homes.remove(&shard);
        }
        self.state = Some(state);

        if coordinator != self.coordinator {
            info!(
                type_name = %self.type_name,
                coordinator = ?coordinator.as_ref().map(ToString::to_string),
                "coordinator location changed"
            );
            self.coordinator = coordinator;
            self.registered = false;
            self.requested.clear();
            self.register(now, out);
        }
        self.check_drained(out);
    }

    fn stop(&mut self, out: &mut Outbox) {
        if self.stopped {
            return;
        }
        warn!(type_name = %self.type_name, entities = self.entities.len(), "node downed, stopping region");
        self.stopped = true;
        let ids: Vec<String> = self.entities.keys().cloned().collect();
        for id in ids {
            self.passivate(&id, out);
        }
        self.hosted.clear();
        for (_, pending) in std::mem::take(&mut self.buffers) {
            for envelope in pending {
                Self::reply(&envelope, RouteOutcome::Unavailable, out);
            }
        }
        self.buffered = 0;
    }

    /// Report drained once a leaving node hosts nothing, or when no other
    /// member could take the shards over.
    fn check_drained(&mut self, out: &mut Outbox) {
        if self.drained {
            return;
        }
        let Some(state) = &self.state else {
            return;
        };
        if !matches!(
            state.self_status(),
            MemberStatus::Leaving | MemberStatus::Exiting
        ) {
            return;
        }
        let role = self.settings.role.as_deref();
        let successor_exists = state
            .members
            .iter()
            .any(|m| m.node != self.self_node && m.status == MemberStatus::Up && m.has_role(role));
        if self.hosted.is_empty() || !successor_exists {
            info!(type_name = %self.type_name, node = %self.self_node, "region drained");
            self.drained = true;
            out.local(LocalEvent::Drained(ComponentId::Region(self.type_name.clone())));
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    fn on_tick(&mut self, now: Duration, out: &mut Outbox) {
        let retry = self.settings.retry_interval;
        if !self.registered {
            let due = self
                .last_register
                .map_or(true, |last| now.saturating_sub(last) >= retry);
            if due {
                self.register(now, out);
            }
        } else {
            let stale: Vec<ShardId> = self
                .buffers
                .keys()
                .filter(|shard| {
                    self.requested
                        .get(*shard)
                        .map_or(true, |at| now.saturating_sub(*at) >= retry)
                })
                .cloned()
                .collect();
            for shard in stale {
                self.send_get_home(now, &shard, out);
            }
        }

        if let Some(idle) = self.settings.passivate_idle_after {
            let expired: Vec<String> = self
                .entities
                .iter()
                .filter(|(_, e)| now.saturating_sub(e.last_active) >= idle)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                self.passivate(&id, out);
            }
        }
    }
}

impl Component for ShardRegion {
    fn id(&self) -> ComponentId {
        ComponentId::Region(self.type_name.clone())
    }

    fn handle(&mut self, now: Duration, input: Input, out: &mut Outbox) {
        match input {
            Input::Local(LocalEvent::RegionDeliver { envelope, .. }) => {
                self.route(now, envelope, out);
            }
            Input::Local(LocalEvent::MembershipChanged(state)) => {
                self.on_membership(now, state, out);
            }
            Input::Remote {
                from,
                message: ClusterMessage::Sharding { message, .. },
            } if !self.stopped => self.on_coordinator_message(now, from, message, out),
            Input::Tick if !self.stopped => self.on_tick(now, out),
            _ => {}
        }
    }
}
