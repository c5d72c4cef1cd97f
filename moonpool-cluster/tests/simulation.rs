//! Cluster simulation test suite.
//!
//! Runs whole clusters under the deterministic simulation driver and checks
//! membership, split-brain, singleton and sharding behavior against the
//! event log.

#[path = "simulation/cluster.rs"]
mod cluster;
#[path = "simulation/invariants.rs"]
mod invariants;
#[path = "simulation/test_scenarios.rs"]
mod test_scenarios;
