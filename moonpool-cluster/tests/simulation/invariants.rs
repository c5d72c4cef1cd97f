//! Safety properties checked over the simulation event log.

#![allow(dead_code)] // Not every scenario checks every property

use std::collections::{BTreeMap, BTreeSet};

use moonpool_cluster::downing::Decision;
use moonpool_cluster::protocol::MessageId;
use moonpool_cluster::sim::SimEvent;
use moonpool_cluster::{ClusterEvent, UniqueAddress};

/// At no point do two nodes host singleton `name` at once, and generations
/// only grow.
pub fn assert_singleton_exclusive(events: &[SimEvent], name: &str) {
    let mut active: BTreeMap<UniqueAddress, u64> = BTreeMap::new();
    let mut last_generation = 0;
    for e in events {
        match &e.event {
            ClusterEvent::SingletonStarted {
                name: n,
                generation,
            } if n == name => {
                assert!(
                    active.is_empty(),
                    "singleton {name} started on {} at {:?} while active on {:?}",
                    e.node,
                    e.at,
                    active
                );
                assert!(
                    *generation > last_generation,
                    "generation {generation} after {last_generation}"
                );
                last_generation = *generation;
                active.insert(e.node.clone(), *generation);
            }
            ClusterEvent::SingletonStopped { name: n, .. } if n == name => {
                active.remove(&e.node);
            }
            ClusterEvent::NodeStopped => {
                active.remove(&e.node);
            }
            _ => {}
        }
    }
}

/// Number of times singleton `name` was started, per node.
pub fn singleton_starts(events: &[SimEvent], name: &str) -> Vec<(UniqueAddress, u64)> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            ClusterEvent::SingletonStarted {
                name: n,
                generation,
            } if n == name => Some((e.node.clone(), *generation)),
            _ => None,
        })
        .collect()
}

/// No entity is live on two nodes at once.
pub fn assert_entities_unique(events: &[SimEvent], type_name: &str) {
    let mut live: BTreeMap<String, UniqueAddress> = BTreeMap::new();
    for e in events {
        match &e.event {
            ClusterEvent::EntityStarted {
                type_name: t,
                entity_id,
            } if t == type_name => {
                if let Some(other) = live.get(entity_id) {
                    assert_eq!(
                        other, &e.node,
                        "entity {entity_id} started on {} at {:?} while live on {other}",
                        e.node, e.at
                    );
                }
                live.insert(entity_id.clone(), e.node.clone());
            }
            ClusterEvent::EntityPassivated {
                type_name: t,
                entity_id,
            } if t == type_name => {
                if live.get(entity_id) == Some(&e.node) {
                    live.remove(entity_id);
                }
            }
            ClusterEvent::NodeStopped => {
                live.retain(|_, node| node != &e.node);
            }
            _ => {}
        }
    }
}

/// No message was processed twice.
pub fn assert_processed_at_most_once(events: &[SimEvent]) {
    let mut seen: BTreeSet<&MessageId> = BTreeSet::new();
    for e in events {
        if let ClusterEvent::MessageProcessed { id, .. } = &e.event {
            assert!(seen.insert(id), "message {id:?} processed twice");
        }
    }
}

/// Down decisions recorded in the log, per node.
pub fn decisions(events: &[SimEvent]) -> Vec<(UniqueAddress, Decision, Vec<UniqueAddress>)> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            ClusterEvent::DownDecision { decision, downed } => {
                Some((e.node.clone(), *decision, downed.clone()))
            }
            _ => None,
        })
        .collect()
}
