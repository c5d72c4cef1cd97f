//! The split-brain resolver component.
//!
//! Watches the published [`ClusterState`] and waits until the set of
//! unreachable members has stayed unchanged for `stable_after`. Any change
//! to the set (a new suspect, a healed link, a member downed elsewhere)
//! restarts the timer. Once stable, the configured strategy decides and the
//! resolver asks the membership service to mark the losing members `Down`.
//!
//! A decision is taken once per unreachable set. A transient partition that
//! heals before `stable_after` never produces a decision.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::strategy::{decide, PartitionView};
use crate::component::{Component, ComponentId, Input, LocalEvent, Outbox};
use crate::config::DowningSettings;
use crate::events::ClusterEvent;
use crate::membership::ClusterState;
use crate::UniqueAddress;

/// Where the resolver is in its stability cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverPhase {
    /// Every member is reachable.
    Stable,
    /// `unreachable` has been unchanged since `since`.
    Unstable {
        /// When the current set was first observed.
        since: Duration,
        /// The unreachable set being timed.
        unreachable: BTreeSet<UniqueAddress>,
    },
    /// A decision was taken for `unreachable`.
    Decided {
        /// The set the decision was taken for.
        unreachable: BTreeSet<UniqueAddress>,
    },
}

/// Split-brain resolver component.
pub struct SplitBrainResolver {
    settings: DowningSettings,
    self_node: UniqueAddress,
    state: Option<Arc<ClusterState>>,
    phase: ResolverPhase,
}

impl SplitBrainResolver {
    /// Create a resolver for `self_node`.
    pub fn new(settings: DowningSettings, self_node: UniqueAddress) -> Self {
        Self {
            settings,
            self_node,
            state: None,
            phase: ResolverPhase::Stable,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> &ResolverPhase {
        &self.phase
    }

    fn on_membership(&mut self, now: Duration, state: Arc<ClusterState>) {
        let unreachable: BTreeSet<UniqueAddress> = state
            .unreachable
            .iter()
            .filter(|n| state.is_alive(n))
            .cloned()
            .collect();
        self.state = Some(state);

        let current = match &self.phase {
            ResolverPhase::Stable => None,
            ResolverPhase::Unstable { unreachable, .. } | ResolverPhase::Decided { unreachable } => {
                Some(unreachable)
            }
        };
        if current == Some(&unreachable) {
            return;
        }
        if unreachable.is_empty() {
            if current.is_some() {
                info!(node = %self.self_node, "all members reachable again");
            }
            self.phase = ResolverPhase::Stable;
        } else {
            debug!(node = %self.self_node, unreachable = unreachable.len(), "unreachable set changed, restarting stability timer");
            self.phase = ResolverPhase::Unstable {
                since: now,
                unreachable,
            };
        }
    }

    fn on_tick(&mut self, now: Duration, out: &mut Outbox) {
        let ResolverPhase::Unstable { since, unreachable } = &self.phase else {
            return;
        };
        if now.saturating_sub(*since) < self.settings.stable_after {
            return;
        }
        let Some(state) = &self.state else {
            return;
        };
        if !state.is_alive(&self.self_node) {
            return;
        }
        let unreachable = unreachable.clone();

        let view = PartitionView::new(
            self.self_node.clone(),
            state.members.iter().cloned(),
            unreachable.clone(),
        );
        let decision = decide(&self.settings, &view);
        let downed = view.nodes_to_down(decision);
        info!(
            node = %self.self_node,
            ?decision,
            my_side = view.my_side().len(),
            other_side = view.other_side().len(),
            downed = downed.len(),
            "split brain resolved"
        );
        out.event(ClusterEvent::DownDecision {
            decision,
            downed: downed.clone(),
        });
        if !downed.is_empty() {
            out.local(LocalEvent::DownMembers(downed));
        }
        self.phase = ResolverPhase::Decided { unreachable };
    }
}

impl Component for SplitBrainResolver {
    fn id(&self) -> ComponentId {
        ComponentId::Resolver
    }

    fn handle(&mut self, now: Duration, input: Input, out: &mut Outbox) {
        match input {
            Input::Local(LocalEvent::MembershipChanged(state)) => self.on_membership(now, state),
            Input::Tick => self.on_tick(now, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Effect;
    use crate::config::DowningStrategyKind;
    use crate::downing::Decision;
    use crate::membership::{Member, MemberStatus, MembershipVersion};
    use crate::NodeAddress;

    fn node(port: u16) -> UniqueAddress {
        UniqueAddress::new(NodeAddress::new("127.0.0.1", port), 1)
    }

    fn state(me: u16, n: u16, unreachable: &[u16]) -> Arc<ClusterState> {
        let members = (1..=n)
            .map(|p| {
                let mut m = Member::joining(node(p), BTreeSet::new());
                m.status = MemberStatus::Up;
                m.ordinal = Some(u64::from(p));
                m
            })
            .collect();
        Arc::new(ClusterState::new(
            node(me),
            members,
            unreachable.iter().map(|p| node(*p)).collect(),
            false,
            MembershipVersion(1),
        ))
    }

    fn settings(strategy: DowningStrategyKind) -> DowningSettings {
        DowningSettings {
            strategy,
            stable_after: Duration::from_secs(2),
            ..DowningSettings::default()
        }
    }

    /// Feed the state at t=0, tick past the stability window and return
    /// the decision and the downed set.
    fn resolve(
        settings: DowningSettings,
        me: u16,
        n: u16,
        unreachable: &[u16],
    ) -> (Decision, Vec<UniqueAddress>) {
        let mut resolver = SplitBrainResolver::new(settings, node(me));
        let mut out = Outbox::new();
        resolver.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::MembershipChanged(state(me, n, unreachable))),
            &mut out,
        );
        resolver.handle(Duration::from_secs(3), Input::Tick, &mut out);
        out.drain()
            .into_iter()
            .find_map(|e| match e {
                Effect::Event(ClusterEvent::DownDecision { decision, downed }) => {
                    Some((decision, downed))
                }
                _ => None,
            })
            .expect("decision taken")
    }

    #[test]
    fn test_keep_majority_three_against_two() {
        let s = settings(DowningStrategyKind::KeepMajority);
        let (decision, downed) = resolve(s.clone(), 1, 5, &[4, 5]);
        assert_eq!(decision, Decision::DownUnreachable);
        assert_eq!(downed, vec![node(4), node(5)]);

        let (decision, downed) = resolve(s, 4, 5, &[1, 2, 3]);
        assert_eq!(decision, Decision::DownReachable);
        assert_eq!(downed, vec![node(4), node(5)]);
    }

    #[test]
    fn test_keep_majority_even_split_downs_both_sides() {
        let s = settings(DowningStrategyKind::KeepMajority);
        let (left, _) = resolve(s.clone(), 1, 6, &[4, 5, 6]);
        let (right, _) = resolve(s, 4, 6, &[1, 2, 3]);
        assert_eq!(left, Decision::DownAll);
        assert_eq!(right, Decision::DownAll);
    }

    #[test]
    fn test_keep_majority_even_split_without_down_all_downs_nobody() {
        let mut s = settings(DowningStrategyKind::KeepMajority);
        s.down_all_when_unstable = false;
        for (me, unreachable) in [(1, [4, 5, 6]), (4, [1, 2, 3])] {
            let (decision, downed) = resolve(s.clone(), me, 6, &unreachable);
            assert_eq!(decision, Decision::NoAction);
            assert!(downed.is_empty());
        }
    }

    #[test]
    fn test_keep_majority_isolated_node_downs_itself() {
        let s = settings(DowningStrategyKind::KeepMajority);
        let (decision, downed) = resolve(s.clone(), 5, 5, &[1, 2, 3, 4]);
        assert_eq!(decision, Decision::DownReachable);
        assert_eq!(downed, vec![node(5)]);

        let (decision, downed) = resolve(s, 1, 5, &[5]);
        assert_eq!(decision, Decision::DownUnreachable);
        assert_eq!(downed, vec![node(5)]);
    }

    #[test]
    fn test_keep_oldest_small_group_with_oldest_survives() {
        let s = settings(DowningStrategyKind::KeepOldest {
            down_if_alone: false,
        });
        // node 1 is oldest and sits with node 2
        let (decision, _) = resolve(s.clone(), 2, 5, &[3, 4, 5]);
        assert_eq!(decision, Decision::DownUnreachable);
        let (decision, _) = resolve(s, 3, 5, &[1, 2]);
        assert_eq!(decision, Decision::DownReachable);
    }

    #[test]
    fn test_static_quorum() {
        let s = settings(DowningStrategyKind::StaticQuorum { quorum_size: 3 });
        assert_eq!(resolve(s.clone(), 1, 5, &[4, 5]).0, Decision::DownUnreachable);
        assert_eq!(resolve(s, 4, 5, &[1, 2, 3]).0, Decision::DownReachable);

        let s = settings(DowningStrategyKind::StaticQuorum { quorum_size: 4 });
        let (left, left_downed) = resolve(s.clone(), 1, 5, &[4, 5]);
        let (right, _) = resolve(s, 4, 5, &[1, 2, 3]);
        assert_eq!(left, Decision::DownAll);
        assert_eq!(right, Decision::DownAll);
        assert_eq!(left_downed.len(), 5);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let s = settings(DowningStrategyKind::KeepMajority);
        let first = resolve(s.clone(), 2, 5, &[4, 5]);
        for _ in 0..10 {
            assert_eq!(resolve(s.clone(), 2, 5, &[4, 5]), first);
        }
        // every node on the same side agrees
        assert_eq!(resolve(s.clone(), 1, 5, &[4, 5]), first);
        assert_eq!(resolve(s, 3, 5, &[4, 5]), first);
    }

    #[test]
    fn test_no_decision_before_stable_after() {
        let mut resolver =
            SplitBrainResolver::new(settings(DowningStrategyKind::KeepMajority), node(1));
        let mut out = Outbox::new();
        resolver.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::MembershipChanged(state(1, 5, &[5]))),
            &mut out,
        );
        resolver.handle(Duration::from_millis(1500), Input::Tick, &mut out);
        assert!(out.effects().is_empty());

        // set changes: timer restarts
        resolver.handle(
            Duration::from_millis(1600),
            Input::Local(LocalEvent::MembershipChanged(state(1, 5, &[4, 5]))),
            &mut out,
        );
        resolver.handle(Duration::from_millis(2500), Input::Tick, &mut out);
        assert!(out.effects().is_empty());

        // heal before the window expires
        resolver.handle(
            Duration::from_millis(3000),
            Input::Local(LocalEvent::MembershipChanged(state(1, 5, &[]))),
            &mut out,
        );
        resolver.handle(Duration::from_secs(10), Input::Tick, &mut out);
        assert!(out.effects().is_empty());
        assert_eq!(resolver.phase(), &ResolverPhase::Stable);
    }

    #[test]
    fn test_decides_once_per_unreachable_set() {
        let mut resolver =
            SplitBrainResolver::new(settings(DowningStrategyKind::KeepMajority), node(1));
        let mut out = Outbox::new();
        resolver.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::MembershipChanged(state(1, 5, &[5]))),
            &mut out,
        );
        resolver.handle(Duration::from_secs(3), Input::Tick, &mut out);
        let first = out.drain();
        assert!(first
            .iter()
            .any(|e| matches!(e, Effect::Local(LocalEvent::DownMembers(nodes)) if nodes == &vec![node(5)])));

        resolver.handle(Duration::from_secs(6), Input::Tick, &mut out);
        assert!(out.effects().is_empty());
    }
}
