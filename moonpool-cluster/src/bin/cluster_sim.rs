//! Runs a five-node simulated cluster through a 3/2 partition and prints
//! what each side decided.
//!
//! Usage: `cluster-sim [seed]`

use std::process;
use std::rc::Rc;
use std::time::Duration;

use moonpool_cluster::sharding::{Entity, EntityContext};
use moonpool_cluster::sim::{SimCluster, SimConfig};
use moonpool_cluster::{ClusterEvent, ClusterSettings, NodeAddress, NodeConfig, UniqueAddress};

struct Noop;

impl Entity for Noop {
    fn receive(&mut self, _ctx: &mut EntityContext, _payload: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let seed = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(42);
    let addr = |port| NodeAddress::new("127.0.0.1", port);

    let mut settings = ClusterSettings::for_simulation();
    settings.seed_nodes = vec![addr(1)];

    let mut sim = SimCluster::new(SimConfig::with_seed(seed));
    for port in 1..=5 {
        let config = NodeConfig::builder(UniqueAddress::new(addr(port), 1), settings.clone())
            .entity_type("noop", Rc::new(|_: &str| Box::new(Noop) as Box<dyn Entity>))
            .build();
        let started = config.and_then(|c| sim.start_node(c));
        if let Err(e) = started {
            eprintln!("ERROR: {e}");
            process::exit(1);
        }
    }

    sim.run_for(Duration::from_secs(5));
    sim.partition(&[addr(1), addr(2), addr(3)], &[addr(4), addr(5)]);
    sim.run_for(Duration::from_secs(20));

    for event in sim.events() {
        if let ClusterEvent::DownDecision { decision, downed } = &event.event {
            let downed: Vec<String> = downed.iter().map(ToString::to_string).collect();
            eprintln!(
                "{:>8?} {} decided {:?}, downing [{}]",
                event.at,
                event.node,
                decision,
                downed.join(", ")
            );
        }
    }

    match sim.cluster_state(&addr(1)).map(|s| s.to_json()) {
        Some(Ok(json)) => println!("{json}"),
        Some(Err(e)) => {
            eprintln!("ERROR: {e}");
            process::exit(1);
        }
        None => {
            eprintln!("ERROR: node 1 published no state");
            process::exit(1);
        }
    }
}
