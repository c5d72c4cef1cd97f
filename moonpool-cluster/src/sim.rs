//! Deterministic simulation driver.
//!
//! [`SimCluster`] runs the same components as [`ClusterNode`](crate::ClusterNode)
//! without Tokio: a virtual clock, a seeded [`ChaCha8Rng`] for network
//! latency and drops, and a single event queue. Two runs with the same seed
//! and the same sequence of calls produce the same event log.
//!
//! The network keeps FIFO order per sender/receiver pair, supports
//! partitions (blocked links) and random drops. Nodes can crash and restart
//! with a new incarnation. Every [`ClusterEvent`] emitted by any node is
//! appended to [`SimCluster::events`] with its virtual timestamp.
//!
//! ```rust,ignore
//! let mut sim = SimCluster::new(SimConfig::with_seed(42));
//! for port in 1..=3 {
//!     sim.start_node(node_config(port))?;
//! }
//! sim.run_for(Duration::from_secs(5));
//! assert_eq!(sim.cluster_state(&addr(1)).map(|s| s.members.len()), Some(3));
//! ```

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::component::{Component, ComponentId, Effect, Input, LocalEvent, Outbox, Target};
use crate::error::ClusterError;
use crate::events::ClusterEvent;
use crate::membership::ClusterState;
use crate::protocol::{ClusterMessage, RouteOutcome};
use crate::sharding::ShardTable;
use crate::wiring::{self, NodeConfig, Wiring};
use crate::{NodeAddress, UniqueAddress};

/// Granularity at which [`SimCluster::run_until`] checks its condition.
const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Network and randomness settings of a simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// RNG seed.
    pub seed: u64,
    /// Minimum one-way latency.
    pub min_latency: Duration,
    /// Maximum one-way latency.
    pub max_latency: Duration,
    /// Probability that a message is dropped.
    pub drop_rate: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(5),
            drop_rate: 0.0,
        }
    }
}

impl SimConfig {
    /// Default network with the given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }
}

/// An event emitted by one node, stamped with virtual time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimEvent {
    /// Virtual time of emission.
    pub at: Duration,
    /// Emitting node.
    pub node: UniqueAddress,
    /// The event.
    pub event: ClusterEvent,
}

enum Work {
    Deliver {
        from: UniqueAddress,
        to: NodeAddress,
        message: ClusterMessage,
    },
    Tick {
        node: UniqueAddress,
    },
    AskDeadline {
        node: UniqueAddress,
        request_id: u64,
    },
}

struct Scheduled {
    at: Duration,
    seq: u64,
    work: Work,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap and the earliest entry must win.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

struct SimNode {
    config: NodeConfig,
    wiring: Wiring,
    components: BTreeMap<ComponentId, Box<dyn Component>>,
    running: bool,
    stop_requested: bool,
    next_request: u64,
    outcomes: BTreeMap<u64, RouteOutcome>,
    state: Option<Arc<ClusterState>>,
    shard_tables: BTreeMap<String, Arc<ShardTable>>,
    singleton_hosts: BTreeMap<String, Option<UniqueAddress>>,
}

impl SimNode {
    fn observe(&mut self, event: &LocalEvent) {
        match event {
            LocalEvent::MembershipChanged(state) => self.state = Some(state.clone()),
            LocalEvent::ShardTableChanged(table) => {
                if table.active {
                    self.shard_tables
                        .insert(table.type_name.clone(), table.clone());
                } else {
                    self.shard_tables.remove(&table.type_name);
                }
            }
            LocalEvent::SingletonHostChanged { name, host } => {
                self.singleton_hosts.insert(name.clone(), host.clone());
            }
            _ => {}
        }
    }
}

/// A simulated cluster.
pub struct SimCluster {
    config: SimConfig,
    now: Duration,
    rng: ChaCha8Rng,
    seq: u64,
    queue: BinaryHeap<Scheduled>,
    nodes: BTreeMap<NodeAddress, SimNode>,
    blocked: BTreeSet<(NodeAddress, NodeAddress)>,
    last_arrival: BTreeMap<(NodeAddress, NodeAddress), Duration>,
    events: Vec<SimEvent>,
}

impl SimCluster {
    /// Create an empty simulation.
    pub fn new(config: SimConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            now: Duration::ZERO,
            seq: 0,
            queue: BinaryHeap::new(),
            nodes: BTreeMap::new(),
            blocked: BTreeSet::new(),
            last_arrival: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Every event emitted so far, in emission order.
    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    fn schedule(&mut self, at: Duration, work: Work) {
        self.seq += 1;
        self.queue.push(Scheduled {
            at,
            seq: self.seq,
            work,
        });
    }

    fn record(&mut self, node: UniqueAddress, event: ClusterEvent) {
        self.events.push(SimEvent {
            at: self.now,
            node,
            event,
        });
    }

    /// Start a node. A node already running at the same address is crashed
    /// first.
    pub fn start_node(&mut self, config: NodeConfig) -> Result<UniqueAddress, ClusterError> {
        let (wiring, components) = wiring::build(&config)?;
        let address = config.address.clone();
        if self.is_running(address.address()) {
            self.crash(address.address());
        }
        info!(node = %address, "simulated node starting");
        let components = components.into_iter().map(|c| (c.id(), c)).collect();
        self.nodes.insert(
            address.address().clone(),
            SimNode {
                config,
                wiring,
                components,
                running: true,
                stop_requested: false,
                next_request: 1,
                outcomes: BTreeMap::new(),
                state: None,
                shard_tables: BTreeMap::new(),
                singleton_hosts: BTreeMap::new(),
            },
        );
        self.schedule(
            self.now,
            Work::Tick {
                node: address.clone(),
            },
        );
        Ok(address)
    }

    /// Stop a node abruptly. Its state is lost.
    pub fn crash(&mut self, address: &NodeAddress) {
        let Some(node) = self.nodes.get_mut(address) else {
            return;
        };
        if !node.running {
            return;
        }
        node.running = false;
        let unique = node.config.address.clone();
        info!(node = %unique, "simulated node crashed");
        self.record(unique, ClusterEvent::NodeStopped);
    }

    /// Restart the node at `address` with the next incarnation.
    pub fn restart(&mut self, address: &NodeAddress) -> Option<Result<UniqueAddress, ClusterError>> {
        let config = self.nodes.get(address)?.config.next_incarnation();
        Some(self.start_node(config))
    }

    /// Ask the node at `address` to leave gracefully.
    pub fn leave(&mut self, address: &NodeAddress) {
        self.run_local(
            address,
            vec![(ComponentId::Membership, Input::Local(LocalEvent::Leave))],
        );
    }

    /// Block traffic in both directions between `a` and `b`.
    pub fn partition(&mut self, a: &[NodeAddress], b: &[NodeAddress]) {
        for x in a {
            for y in b {
                self.blocked.insert((x.clone(), y.clone()));
                self.blocked.insert((y.clone(), x.clone()));
            }
        }
    }

    /// Remove every partition.
    pub fn heal(&mut self) {
        self.blocked.clear();
    }

    /// Change the drop probability.
    pub fn set_drop_rate(&mut self, rate: f64) {
        self.config.drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Route a request from the node at `from`; returns its request id, or
    /// `None` when that node is not running.
    pub fn ask(&mut self, from: &NodeAddress, target: Target, payload: Vec<u8>) -> Option<u64> {
        self.submit(from, target, payload, true)
    }

    /// Route a message that expects no reply.
    pub fn tell(&mut self, from: &NodeAddress, target: Target, payload: Vec<u8>) -> Option<u64> {
        self.submit(from, target, payload, false)
    }

    fn submit(
        &mut self,
        from: &NodeAddress,
        target: Target,
        payload: Vec<u8>,
        expects_reply: bool,
    ) -> Option<u64> {
        let node = self.nodes.get_mut(from).filter(|n| n.running)?;
        let request_id = node.next_request;
        node.next_request += 1;
        let unique = node.config.address.clone();
        let ask_timeout = node.config.settings.router.ask_timeout;
        if expects_reply {
            self.schedule(
                self.now + ask_timeout,
                Work::AskDeadline {
                    node: unique,
                    request_id,
                },
            );
        }
        self.run_local(
            from,
            vec![(
                ComponentId::Router,
                Input::Local(LocalEvent::Ask {
                    request_id,
                    target,
                    payload,
                    expects_reply,
                }),
            )],
        );
        Some(request_id)
    }

    /// Outcome of a request issued with [`ask`](Self::ask), once resolved.
    pub fn outcome(&self, from: &NodeAddress, request_id: u64) -> Option<&RouteOutcome> {
        self.nodes.get(from)?.outcomes.get(&request_id)
    }

    /// Whether a node is running at `address`.
    pub fn is_running(&self, address: &NodeAddress) -> bool {
        self.nodes.get(address).is_some_and(|n| n.running)
    }

    /// Current incarnation at `address`.
    pub fn unique_address(&self, address: &NodeAddress) -> Option<&UniqueAddress> {
        self.nodes.get(address).map(|n| &n.config.address)
    }

    /// Addresses of running nodes.
    pub fn running_nodes(&self) -> Vec<NodeAddress> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.running)
            .map(|(a, _)| a.clone())
            .collect()
    }

    /// Latest membership snapshot published by the node at `address`.
    pub fn cluster_state(&self, address: &NodeAddress) -> Option<Arc<ClusterState>> {
        self.nodes.get(address)?.state.clone()
    }

    /// The active shard table of `type_name` with the highest generation
    /// among running nodes.
    pub fn shard_table(&self, type_name: &str) -> Option<Arc<ShardTable>> {
        self.nodes
            .values()
            .filter(|n| n.running)
            .filter_map(|n| n.shard_tables.get(type_name))
            .max_by_key(|t| t.generation)
            .cloned()
    }

    /// Host of singleton `name` as seen by the proxy of the node at `address`.
    pub fn singleton_host(&self, address: &NodeAddress, name: &str) -> Option<UniqueAddress> {
        self.nodes
            .get(address)?
            .singleton_hosts
            .get(name)
            .cloned()
            .flatten()
    }

    /// Advance virtual time by `duration`, processing everything due.
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now + duration;
        while self.queue.peek().is_some_and(|s| s.at <= until) {
            let Some(scheduled) = self.queue.pop() else {
                break;
            };
            self.now = scheduled.at;
            match scheduled.work {
                Work::Deliver { from, to, message } => self.deliver(from, to, message),
                Work::Tick { node } => self.tick(node),
                Work::AskDeadline { node, request_id } => self.ask_deadline(node, request_id),
            }
        }
        self.now = until;
    }

    /// Run until `condition` holds or `limit` elapses. Returns whether the
    /// condition was met.
    pub fn run_until(&mut self, limit: Duration, mut condition: impl FnMut(&SimCluster) -> bool) -> bool {
        let deadline = self.now + limit;
        while self.now < deadline {
            if condition(self) {
                return true;
            }
            self.run_for(CHECK_INTERVAL.min(deadline - self.now));
        }
        condition(self)
    }

    fn deliver(&mut self, from: UniqueAddress, to: NodeAddress, message: ClusterMessage) {
        let Some(node) = self.nodes.get(&to).filter(|n| n.running) else {
            return;
        };
        let work = node
            .wiring
            .remote_targets(&message)
            .into_iter()
            .map(|target| {
                (
                    target,
                    Input::Remote {
                        from: from.clone(),
                        message: message.clone(),
                    },
                )
            })
            .collect();
        self.run_local(&to, work);
    }

    fn tick(&mut self, unique: UniqueAddress) {
        let address = unique.address().clone();
        let Some(node) = self.nodes.get_mut(&address) else {
            return;
        };
        if !node.running || node.config.address != unique {
            return;
        }
        if node.stop_requested {
            node.running = false;
            info!(node = %unique, "simulated node stopped");
            self.record(unique, ClusterEvent::NodeStopped);
            return;
        }
        let interval = node.config.settings.tick_interval;
        let work = node
            .components
            .keys()
            .map(|id| (id.clone(), Input::Tick))
            .collect();
        self.schedule(self.now + interval, Work::Tick { node: unique });
        self.run_local(&address, work);
    }

    /// Resolve a request that is still open when its ask timeout elapses.
    /// The router component drops its own entry on a later tick.
    fn ask_deadline(&mut self, unique: UniqueAddress, request_id: u64) {
        let Some(node) = self.nodes.get_mut(unique.address()) else {
            return;
        };
        if !node.running || node.config.address != unique {
            return;
        }
        if let Entry::Vacant(slot) = node.outcomes.entry(request_id) {
            debug!(node = %unique, request_id, "ask deadline elapsed");
            slot.insert(RouteOutcome::Timeout);
        }
    }

    /// Process inputs on one node until no local work is left.
    fn run_local(&mut self, address: &NodeAddress, initial: Vec<(ComponentId, Input)>) {
        let mut work: VecDeque<(ComponentId, Input)> = initial.into();
        let mut out = Outbox::new();
        while let Some((target, input)) = work.pop_front() {
            let Some(node) = self.nodes.get_mut(address).filter(|n| n.running) else {
                return;
            };
            let Some(component) = node.components.get_mut(&target) else {
                continue;
            };
            component.handle(self.now, input, &mut out);
            for effect in out.drain() {
                self.apply(address, effect, &mut work);
            }
        }
    }

    fn apply(&mut self, address: &NodeAddress, effect: Effect, work: &mut VecDeque<(ComponentId, Input)>) {
        let Some(node) = self.nodes.get_mut(address) else {
            return;
        };
        let from = node.config.address.clone();
        match effect {
            Effect::Send { to, message } => {
                if &to == address {
                    for target in node.wiring.remote_targets(&message) {
                        work.push_back((
                            target,
                            Input::Remote {
                                from: from.clone(),
                                message: message.clone(),
                            },
                        ));
                    }
                } else {
                    self.transmit(from, to, message);
                }
            }
            Effect::Local(event) => {
                node.observe(&event);
                for target in node.wiring.local_targets(&event) {
                    work.push_back((target, Input::Local(event.clone())));
                }
            }
            Effect::Event(event) => {
                if matches!(event, ClusterEvent::SelfDowned | ClusterEvent::SelfRemoved) {
                    node.stop_requested = true;
                }
                self.record(from, event);
            }
            Effect::Complete {
                request_id,
                outcome,
            } => {
                // the first outcome wins, a late reply after the deadline is dropped
                node.outcomes.entry(request_id).or_insert(outcome);
            }
        }
    }

    fn transmit(&mut self, from: UniqueAddress, to: NodeAddress, message: ClusterMessage) {
        let link = (from.address().clone(), to.clone());
        if self.blocked.contains(&link) {
            return;
        }
        if self.config.drop_rate > 0.0 && self.rng.gen_bool(self.config.drop_rate) {
            debug!(from = %from, to = %to, "simulated drop");
            return;
        }
        let latency = if self.config.max_latency > self.config.min_latency {
            self.rng
                .gen_range(self.config.min_latency..=self.config.max_latency)
        } else {
            self.config.min_latency
        };
        let earliest = self.last_arrival.get(&link).copied().unwrap_or_default();
        let at = (self.now + latency).max(earliest);
        self.last_arrival.insert(link, at);
        self.schedule(at, Work::Deliver { from, to, message });
    }
}
