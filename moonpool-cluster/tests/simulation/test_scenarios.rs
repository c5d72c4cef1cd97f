//! Whole-cluster scenarios.

use std::time::Duration;

use moonpool_cluster::downing::Decision;
use moonpool_cluster::sharding::{HashExtractor, ShardExtractor};
use moonpool_cluster::sim::SimCluster;
use moonpool_cluster::{ClusterEvent, ClusterSettings, DowningStrategyKind, RouteOutcome, Target};

use super::cluster::{
    addr, addrs, all_up, ask_and_wait, settings, start_cluster, start_cluster_with, ENTITY_TYPE,
    SINGLETON,
};
use super::invariants::{
    assert_entities_unique, assert_processed_at_most_once, assert_singleton_exclusive, decisions,
    singleton_starts,
};

const SETTLE: Duration = Duration::from_secs(30);

fn stopped(sim: &SimCluster, ports: &[u16]) -> bool {
    ports.iter().all(|p| !sim.is_running(&addr(*p)))
}

fn running(sim: &SimCluster, ports: &[u16]) -> bool {
    ports.iter().all(|p| sim.is_running(&addr(*p)))
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[test]
fn test_cluster_formation() {
    let mut sim = start_cluster(1, 5);

    let leaders: Vec<_> = (1..=5)
        .filter_map(|p| sim.cluster_state(&addr(p)).and_then(|s| s.leader.clone()))
        .collect();
    assert_eq!(leaders.len(), 5);
    assert!(leaders.windows(2).all(|w| w[0] == w[1]), "leaders differ: {leaders:?}");

    let state = sim.cluster_state(&addr(3)).expect("state");
    assert_eq!(
        state.oldest.as_ref().map(|o| o.address().clone()),
        Some(addr(1))
    );
    let json = state.to_json().expect("json");
    assert!(json.contains("127.0.0.1:5"));

    sim.run_for(Duration::from_secs(2));
    let starts = singleton_starts(sim.events(), SINGLETON);
    assert_eq!(starts.len(), 1, "starts: {starts:?}");
    assert_eq!(starts[0].0.address(), &addr(1));
    assert_eq!(starts[0].1, 1);
    assert_eq!(
        sim.singleton_host(&addr(4), SINGLETON)
            .map(|h| h.address().clone()),
        Some(addr(1))
    );
}

#[test]
fn test_rejoin_with_new_incarnation() {
    let mut sim = start_cluster(7, 3);
    sim.crash(&addr(3));
    let removed = sim.run_until(SETTLE, |s| all_up(s, &[1, 2], &[1, 2]));
    assert!(removed, "crashed node was not removed");

    let restarted = sim
        .restart(&addr(3))
        .expect("node known")
        .expect("restart");
    assert_eq!(restarted.incarnation(), 2);

    let rejoined = sim.run_until(SETTLE, |s| all_up(s, &[1, 2, 3], &[1, 2, 3]));
    assert!(rejoined, "restarted node did not rejoin");
    let state = sim.cluster_state(&addr(1)).expect("state");
    let member = state
        .members
        .iter()
        .find(|m| m.node.address() == &addr(3))
        .expect("member");
    assert_eq!(member.node, restarted);
}

// ---------------------------------------------------------------------------
// Split-brain resolution
// ---------------------------------------------------------------------------

#[test]
fn test_keep_majority_three_against_two() {
    let mut sim = start_cluster(11, 5);
    sim.partition(&addrs(&[1, 2, 3]), &addrs(&[4, 5]));

    let resolved = sim.run_until(SETTLE, |s| stopped(s, &[4, 5]) && all_up(s, &[1, 2, 3], &[1, 2, 3]));
    assert!(resolved, "partition was not resolved");
    assert!(running(&sim, &[1, 2, 3]));

    for (node, decision, _) in decisions(sim.events()) {
        let port = node.address().port();
        let expected = if port <= 3 {
            Decision::DownUnreachable
        } else {
            Decision::DownReachable
        };
        assert_eq!(decision, expected, "decision on {node}");
    }
    assert_singleton_exclusive(sim.events(), SINGLETON);
}

#[test]
fn test_keep_majority_even_split_downs_everyone() {
    let mut sim = start_cluster(12, 6);
    sim.partition(&addrs(&[1, 2, 3]), &addrs(&[4, 5, 6]));

    let all_down = sim.run_until(SETTLE, |s| stopped(s, &[1, 2, 3, 4, 5, 6]));
    assert!(all_down, "an even split must down both sides");
    assert!(decisions(sim.events())
        .iter()
        .all(|(_, d, _)| *d == Decision::DownAll));
}

#[test]
fn test_keep_majority_isolated_node_downs_itself() {
    let mut sim = start_cluster(13, 5);
    sim.partition(&addrs(&[5]), &addrs(&[1, 2, 3, 4]));

    let resolved = sim.run_until(SETTLE, |s| stopped(s, &[5]) && all_up(s, &[1, 2, 3, 4], &[1, 2, 3, 4]));
    assert!(resolved);
    assert!(running(&sim, &[1, 2, 3, 4]));
}

#[test]
fn test_keep_oldest_survives_in_minority() {
    let mut s = settings();
    s.downing.strategy = DowningStrategyKind::KeepOldest {
        down_if_alone: false,
    };
    let mut sim = start_cluster_with(21, 5, s);
    sim.partition(&addrs(&[1, 2]), &addrs(&[3, 4, 5]));

    let resolved = sim.run_until(SETTLE, |s| stopped(s, &[3, 4, 5]) && all_up(s, &[1, 2], &[1, 2]));
    assert!(resolved, "side with the oldest should survive");
    assert!(running(&sim, &[1, 2]));
}

#[test]
fn test_keep_oldest_three_way_split() {
    let mut s = settings();
    s.downing.strategy = DowningStrategyKind::KeepOldest {
        down_if_alone: false,
    };
    let mut sim = start_cluster_with(22, 5, s);
    sim.partition(&addrs(&[1, 2]), &addrs(&[3, 4, 5]));
    sim.partition(&addrs(&[3, 4]), &addrs(&[5]));

    let resolved = sim.run_until(SETTLE, |s| {
        stopped(s, &[3, 4, 5]) && all_up(s, &[1, 2], &[1, 2])
    });
    assert!(resolved, "only the group holding the oldest should survive");
    assert!(running(&sim, &[1, 2]));
    for (node, decision, _) in decisions(sim.events()) {
        let expected = if node.address().port() <= 2 {
            Decision::DownUnreachable
        } else {
            Decision::DownReachable
        };
        assert_eq!(decision, expected, "decision on {node}");
    }
}

#[test]
fn test_keep_majority_even_split_without_down_all_keeps_both_sides() {
    let mut s = settings();
    s.downing.down_all_when_unstable = false;
    let stable_after = s.downing.stable_after;
    let mut sim = start_cluster_with(14, 6, s);
    sim.partition(&addrs(&[1, 2, 3]), &addrs(&[4, 5, 6]));

    sim.run_for(stable_after * 5);
    assert!(running(&sim, &[1, 2, 3, 4, 5, 6]), "a tie downs nobody");
    let taken = decisions(sim.events());
    assert!(!taken.is_empty(), "both sides should have decided");
    for (node, decision, downed) in taken {
        assert_eq!(decision, Decision::NoAction, "decision on {node}");
        assert!(downed.is_empty());
    }
}

#[test]
fn test_static_quorum_three() {
    let mut s = settings();
    s.downing.strategy = DowningStrategyKind::StaticQuorum { quorum_size: 3 };
    let mut sim = start_cluster_with(31, 5, s);
    sim.partition(&addrs(&[1, 2, 3]), &addrs(&[4, 5]));

    let resolved = sim.run_until(SETTLE, |s| stopped(s, &[4, 5]) && all_up(s, &[1, 2, 3], &[1, 2, 3]));
    assert!(resolved);
}

#[test]
fn test_static_quorum_four_downs_everyone() {
    let mut s = settings();
    s.downing.strategy = DowningStrategyKind::StaticQuorum { quorum_size: 4 };
    let mut sim = start_cluster_with(32, 5, s);
    sim.partition(&addrs(&[1, 2, 3]), &addrs(&[4, 5]));

    let all_down = sim.run_until(SETTLE, |s| stopped(s, &[1, 2, 3, 4, 5]));
    assert!(all_down, "no side reaches the quorum");
}

#[test]
fn test_decision_waits_for_stable_after() {
    let s = settings();
    let stable_after = s.downing.stable_after;
    let mut sim = start_cluster_with(41, 5, s);
    sim.partition(&addrs(&[1, 2, 3]), &addrs(&[4, 5]));
    assert!(sim.run_until(SETTLE, |s| stopped(s, &[4, 5])));

    let observer = sim.unique_address(&addr(1)).expect("node 1").clone();
    let first_unreachable = sim
        .events()
        .iter()
        .find(|e| e.node == observer && matches!(e.event, ClusterEvent::Unreachable { .. }))
        .map(|e| e.at)
        .expect("unreachable observed");
    let decided = sim
        .events()
        .iter()
        .find(|e| e.node == observer && matches!(e.event, ClusterEvent::DownDecision { .. }))
        .map(|e| e.at)
        .expect("decision taken");
    assert!(
        decided - first_unreachable >= stable_after,
        "decided after {:?}",
        decided - first_unreachable
    );
}

#[test]
fn test_same_seed_same_history() {
    let run = |seed| {
        let mut sim = start_cluster(seed, 5);
        sim.partition(&addrs(&[1, 2, 3]), &addrs(&[4, 5]));
        sim.run_for(Duration::from_secs(10));
        sim.events().to_vec()
    };
    assert_eq!(run(51), run(51));
}

// ---------------------------------------------------------------------------
// Singletons
// ---------------------------------------------------------------------------

#[test]
fn test_singleton_fails_over_after_crash() {
    let mut sim = start_cluster(61, 5);
    sim.run_for(Duration::from_secs(2));
    sim.crash(&addr(1));

    let moved = sim.run_until(SETTLE, |s| {
        singleton_starts(s.events(), SINGLETON)
            .iter()
            .any(|(node, _)| node.address() == &addr(2))
    });
    assert!(moved, "singleton did not fail over");
    let starts = singleton_starts(sim.events(), SINGLETON);
    assert_eq!(starts.last().map(|(_, g)| *g), Some(2));
    assert_singleton_exclusive(sim.events(), SINGLETON);

    let reply = ask_and_wait(&mut sim, 3, Target::singleton(SINGLETON), b"ping");
    assert!(matches!(reply, Some(RouteOutcome::Success(_))), "got {reply:?}");
}

#[test]
fn test_singletons_stay_exclusive_when_oldest_is_in_minority() {
    let coordinator = format!("{ENTITY_TYPE}-coordinator");
    for seed in 200..215 {
        let mut sim = start_cluster(seed, 5);
        let placed = sim.run_until(SETTLE, |s| {
            singleton_starts(s.events(), SINGLETON)
                .iter()
                .any(|(node, _)| node.address() == &addr(1))
        });
        assert!(placed, "seed {seed}: singleton not placed on the oldest");

        sim.partition(&addrs(&[1, 2]), &addrs(&[3, 4, 5]));
        let failed_over = sim.run_until(SETTLE, |s| {
            stopped(s, &[1, 2])
                && singleton_starts(s.events(), SINGLETON)
                    .iter()
                    .any(|(node, _)| node.address() == &addr(3))
        });
        assert!(failed_over, "seed {seed}: singleton did not move to node 3");
        let located = sim.run_until(SETTLE, |s| {
            s.singleton_host(&addr(4), SINGLETON)
                .is_some_and(|host| host.address() == &addr(3))
        });
        assert!(located, "seed {seed}: proxy on node 4 did not find node 3");

        let reply = ask_and_wait(&mut sim, 4, Target::singleton(SINGLETON), b"tick");
        assert!(
            matches!(reply, Some(RouteOutcome::Success(_))),
            "seed {seed}: singleton ask after failover returned {reply:?}"
        );
        let reply = ask_and_wait(&mut sim, 5, Target::entity(ENTITY_TYPE, "carol"), b"inc");
        assert!(
            matches!(reply, Some(RouteOutcome::Success(_))),
            "seed {seed}: entity ask after failover returned {reply:?}"
        );

        assert_singleton_exclusive(sim.events(), SINGLETON);
        assert_singleton_exclusive(sim.events(), &coordinator);
        assert!(singleton_starts(sim.events(), &coordinator)
            .iter()
            .any(|(node, _)| node.address().port() == 3));
    }
}

#[test]
fn test_graceful_leave_hands_over_singleton() {
    let mut sim = start_cluster(71, 4);
    sim.run_for(Duration::from_secs(2));
    sim.leave(&addr(1));

    let done = sim.run_until(SETTLE, |s| {
        stopped(s, &[1])
            && singleton_starts(s.events(), SINGLETON)
                .iter()
                .any(|(node, _)| node.address() == &addr(2))
    });
    assert!(done, "leaving node did not hand over and exit");
    assert!(sim
        .events()
        .iter()
        .any(|e| e.node.address() == &addr(1) && e.event == ClusterEvent::SelfRemoved));
    assert!(decisions(sim.events()).is_empty());
    assert_singleton_exclusive(sim.events(), SINGLETON);
    assert_singleton_exclusive(sim.events(), &format!("{ENTITY_TYPE}-coordinator"));
}

// ---------------------------------------------------------------------------
// Sharding and routing
// ---------------------------------------------------------------------------

fn entity(i: usize) -> Target {
    Target::entity(ENTITY_TYPE, format!("e{i}"))
}

#[test]
fn test_entities_route_and_rebalance() {
    let mut sim = start_cluster(81, 3);
    for i in 0..20 {
        let reply = ask_and_wait(&mut sim, 1 + (i % 3) as u16, entity(i), b"inc");
        assert!(matches!(reply, Some(RouteOutcome::Success(_))), "e{i}: {reply:?}");
    }

    for port in [4, 5] {
        sim.start_node(super::cluster::node_config(port, settings()))
            .expect("node starts");
    }
    let ports = [1, 2, 3, 4, 5];
    assert!(sim.run_until(SETTLE, |s| all_up(s, &ports, &ports)));

    for round in 0..10 {
        for i in 0..20 {
            sim.tell(&addr(ports[(round + i) % 5]), entity(i), b"inc".to_vec());
        }
        sim.run_for(Duration::from_millis(300));
    }
    sim.run_for(Duration::from_secs(5));

    let table = sim.shard_table(ENTITY_TYPE).expect("shard table");
    let counts = table.counts();
    assert!(
        counts.keys().any(|n| n.address() == &addr(4) || n.address() == &addr(5)),
        "new nodes got no shards: {counts:?}"
    );
    assert!(table.handoffs.is_empty());
    assert!(sim
        .events()
        .iter()
        .any(|e| matches!(e.event, ClusterEvent::HandoffCompleted { .. })));

    for i in 0..20 {
        let reply = ask_and_wait(&mut sim, 5, entity(i), b"get");
        assert!(matches!(reply, Some(RouteOutcome::Success(_))), "e{i}: {reply:?}");
    }

    assert_entities_unique(sim.events(), ENTITY_TYPE);
    assert_processed_at_most_once(sim.events());
}

#[test]
fn test_entity_passivation_restarts_state() {
    let mut sim = start_cluster(82, 3);
    let target = Target::entity(ENTITY_TYPE, "alice");
    assert_eq!(
        ask_and_wait(&mut sim, 2, target.clone(), b"inc"),
        Some(RouteOutcome::Success(b"1".to_vec()))
    );
    assert_eq!(
        ask_and_wait(&mut sim, 3, target.clone(), b"stop"),
        Some(RouteOutcome::Success(b"1".to_vec()))
    );
    assert_eq!(
        ask_and_wait(&mut sim, 1, target, b"inc"),
        Some(RouteOutcome::Success(b"1".to_vec()))
    );
    assert!(sim
        .events()
        .iter()
        .any(|e| matches!(&e.event, ClusterEvent::EntityPassivated { entity_id, .. } if entity_id == "alice")));
}

#[test]
fn test_unknown_target_is_unavailable() {
    let mut sim = start_cluster(91, 3);
    assert_eq!(
        ask_and_wait(&mut sim, 1, Target::entity("cart", "x"), b"inc"),
        Some(RouteOutcome::Unavailable)
    );
    assert_eq!(
        ask_and_wait(&mut sim, 1, Target::singleton("nope"), b"inc"),
        Some(RouteOutcome::Unavailable)
    );
}

#[test]
fn test_ask_times_out_when_owner_is_cut_off() {
    // Production tick: the deadline must not wait for the next tick.
    let mut cluster_settings = settings();
    cluster_settings.tick_interval = ClusterSettings::default().tick_interval;
    let ask_timeout = cluster_settings.router.ask_timeout;
    let number_of_shards = cluster_settings.sharding.number_of_shards;

    let mut sim = start_cluster_with(92, 3, cluster_settings);
    let target = Target::entity(ENTITY_TYPE, "bob");
    let first = ask_and_wait(&mut sim, 1, target.clone(), b"inc");
    assert!(matches!(first, Some(RouteOutcome::Success(_))));

    let table = sim.shard_table(ENTITY_TYPE).expect("shard table");
    let shard = HashExtractor::new(number_of_shards).shard_id("bob");
    let owner = table
        .owner(&shard)
        .expect("bob's shard has an owner")
        .address()
        .port();
    let requester = if owner == 1 { 2 } else { 1 };
    // Warm the requester's routing cache before cutting the link.
    let warm = ask_and_wait(&mut sim, requester, target.clone(), b"inc");
    assert!(matches!(warm, Some(RouteOutcome::Success(_))));

    sim.partition(&addrs(&[requester]), &addrs(&[owner]));
    let request_id = sim
        .ask(&addr(requester), target, b"inc".to_vec())
        .expect("requester running");
    sim.run_for(ask_timeout / 2);
    assert_eq!(sim.outcome(&addr(requester), request_id), None);

    sim.run_for(ask_timeout - ask_timeout / 2);
    assert_eq!(
        sim.outcome(&addr(requester), request_id),
        Some(&RouteOutcome::Timeout)
    );

    // The router's own expiry on a later tick does not replace the outcome.
    sim.run_for(Duration::from_secs(1));
    assert_eq!(
        sim.outcome(&addr(requester), request_id),
        Some(&RouteOutcome::Timeout)
    );
}
