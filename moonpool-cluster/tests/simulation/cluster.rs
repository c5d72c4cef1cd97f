//! Cluster setup helpers and test behaviors.

#![allow(dead_code)] // Not every scenario uses every helper

use std::rc::Rc;
use std::time::Duration;

use moonpool_cluster::membership::MemberStatus;
use moonpool_cluster::sharding::{Entity, EntityContext};
use moonpool_cluster::sim::{SimCluster, SimConfig};
use moonpool_cluster::singleton::SingletonBehavior;
use moonpool_cluster::{ClusterSettings, NodeAddress, NodeConfig, UniqueAddress};

pub const ENTITY_TYPE: &str = "counter";
pub const SINGLETON: &str = "scheduler";

/// Entity counting the `inc` messages it received.
pub struct Counter {
    count: u64,
}

impl Entity for Counter {
    fn receive(&mut self, ctx: &mut EntityContext, payload: &[u8]) -> Vec<u8> {
        match payload {
            b"inc" => self.count += 1,
            b"stop" => ctx.passivate(),
            _ => {}
        }
        self.count.to_string().into_bytes()
    }
}

/// Singleton answering with the number of messages it processed.
pub struct Scheduler {
    processed: u64,
}

impl SingletonBehavior for Scheduler {
    fn receive(&mut self, _payload: &[u8]) -> Vec<u8> {
        self.processed += 1;
        self.processed.to_string().into_bytes()
    }
}

pub fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("127.0.0.1", port)
}

pub fn addrs(ports: &[u16]) -> Vec<NodeAddress> {
    ports.iter().map(|p| addr(*p)).collect()
}

pub fn settings() -> ClusterSettings {
    let mut settings = ClusterSettings::for_simulation();
    settings.seed_nodes = vec![addr(1)];
    settings
}

pub fn node_config(port: u16, settings: ClusterSettings) -> NodeConfig {
    NodeConfig::builder(UniqueAddress::new(addr(port), 1), settings)
        .entity_type(
            ENTITY_TYPE,
            Rc::new(|_: &str| Box::new(Counter { count: 0 }) as Box<dyn Entity>),
        )
        .singleton(
            SINGLETON,
            Rc::new(|| Box::new(Scheduler { processed: 0 }) as Box<dyn SingletonBehavior>),
        )
        .build()
        .expect("valid node config")
}

/// Whether every node in `observers` sees exactly `ports` as `Up` members.
pub fn all_up(sim: &SimCluster, observers: &[u16], ports: &[u16]) -> bool {
    observers.iter().all(|o| {
        sim.cluster_state(&addr(*o)).is_some_and(|state| {
            state.members.len() == ports.len()
                && state.unreachable.is_empty()
                && ports.iter().all(|p| {
                    state
                        .members
                        .iter()
                        .any(|m| m.node.address() == &addr(*p) && m.status == MemberStatus::Up)
                })
        })
    })
}

/// Start nodes `1..=n` with `settings` and wait until they all see each
/// other `Up`.
pub fn start_cluster_with(seed: u64, n: u16, settings: ClusterSettings) -> SimCluster {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let mut sim = SimCluster::new(SimConfig::with_seed(seed));
    let ports: Vec<u16> = (1..=n).collect();
    for port in &ports {
        sim.start_node(node_config(*port, settings.clone()))
            .expect("node starts");
    }
    let formed = sim.run_until(Duration::from_secs(20), |s| all_up(s, &ports, &ports));
    assert!(formed, "cluster of {n} did not form");
    sim
}

pub fn start_cluster(seed: u64, n: u16) -> SimCluster {
    start_cluster_with(seed, n, settings())
}

/// Issue an ask and run until it resolves.
pub fn ask_and_wait(
    sim: &mut SimCluster,
    from: u16,
    target: moonpool_cluster::Target,
    payload: &[u8],
) -> Option<moonpool_cluster::RouteOutcome> {
    let request_id = sim.ask(&addr(from), target, payload.to_vec())?;
    sim.run_until(Duration::from_secs(5), |s| {
        s.outcome(&addr(from), request_id).is_some()
    });
    sim.outcome(&addr(from), request_id).cloned()
}
