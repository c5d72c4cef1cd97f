//! Split-brain strategies.
//!
//! A strategy looks at a [`PartitionView`] ("my side" versus "everyone I
//! cannot reach") and answers with a [`Decision`]. Strategies are pure
//! functions of the view and the settings: two nodes on the same side with
//! the same view reach the same decision without talking to each other.
//!
//! Only `Up` and `Leaving` members are counted. Members in other states are
//! still downed along with the losing side.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::{DowningSettings, DowningStrategyKind, TieBreak};
use crate::membership::Member;
use crate::UniqueAddress;

/// Outcome of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// My side survives; down the unreachable side.
    DownUnreachable,
    /// My side loses; down the reachable side, including this node.
    DownReachable,
    /// Down every member.
    DownAll,
    /// Take no action.
    NoAction,
}

impl Decision {
    /// Whether this node survives the decision.
    pub fn survives(self) -> bool {
        matches!(self, Self::DownUnreachable | Self::NoAction)
    }
}

/// Partition as seen from one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionView {
    /// The node evaluating.
    pub self_node: UniqueAddress,
    /// Every member that is neither `Down` nor `Removed`.
    pub members: Vec<Member>,
    /// Members this node cannot reach.
    pub unreachable: BTreeSet<UniqueAddress>,
}

impl PartitionView {
    /// Build a view, dropping members that are already `Down` or `Removed`.
    pub fn new(
        self_node: UniqueAddress,
        members: impl IntoIterator<Item = Member>,
        unreachable: BTreeSet<UniqueAddress>,
    ) -> Self {
        let members = members
            .into_iter()
            .filter(|m| !m.status.is_terminal())
            .collect();
        Self {
            self_node,
            members,
            unreachable,
        }
    }

    fn considered(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.status.is_considered())
    }

    /// Counted members on this node's side.
    pub fn my_side(&self) -> BTreeSet<UniqueAddress> {
        self.considered()
            .filter(|m| !self.unreachable.contains(&m.node))
            .map(|m| m.node.clone())
            .collect()
    }

    /// Counted members on the unreachable side.
    pub fn other_side(&self) -> BTreeSet<UniqueAddress> {
        self.considered()
            .filter(|m| self.unreachable.contains(&m.node))
            .map(|m| m.node.clone())
            .collect()
    }

    fn oldest(&self) -> Option<&Member> {
        self.considered().min_by(|a, b| a.age_key().cmp(&b.age_key()))
    }

    /// The members `decision` downs, in address order.
    pub fn nodes_to_down(&self, decision: Decision) -> Vec<UniqueAddress> {
        let pick = |reachable: Option<bool>| {
            self.members
                .iter()
                .filter(|m| match reachable {
                    Some(true) => !self.unreachable.contains(&m.node),
                    Some(false) => self.unreachable.contains(&m.node),
                    None => true,
                })
                .map(|m| m.node.clone())
                .collect()
        };
        match decision {
            Decision::DownUnreachable => pick(Some(false)),
            Decision::DownReachable => pick(Some(true)),
            Decision::DownAll => pick(None),
            Decision::NoAction => Vec::new(),
        }
    }
}

fn tie_break(tie_break: TieBreak, view: &PartitionView) -> Decision {
    match tie_break {
        TieBreak::LowestAddress => {
            let mine = view.my_side().into_iter().next();
            let theirs = view.other_side().into_iter().next();
            match (mine, theirs) {
                (Some(m), Some(t)) if m < t => Decision::DownUnreachable,
                (Some(_), None) => Decision::DownUnreachable,
                _ => Decision::DownReachable,
            }
        }
        TieBreak::DownAll => Decision::DownAll,
        TieBreak::NoAction => Decision::NoAction,
    }
}

/// Apply the configured strategy to a view.
pub fn decide(settings: &DowningSettings, view: &PartitionView) -> Decision {
    let mine = view.my_side().len();
    let others = view.other_side().len();

    match &settings.strategy {
        DowningStrategyKind::KeepMajority => {
            let total = mine + others;
            if mine * 2 > total {
                Decision::DownUnreachable
            } else if mine * 2 == total {
                // an exact tie has no safe survivor
                if settings.down_all_when_unstable {
                    Decision::DownAll
                } else {
                    Decision::NoAction
                }
            } else {
                Decision::DownReachable
            }
        }
        DowningStrategyKind::KeepOldest { down_if_alone } => {
            let Some(oldest) = view.oldest() else {
                return Decision::NoAction;
            };
            let oldest_is_mine = !view.unreachable.contains(&oldest.node);
            match (oldest_is_mine, *down_if_alone) {
                (true, true) if mine == 1 && others > 0 => Decision::DownReachable,
                (true, _) => Decision::DownUnreachable,
                (false, true) if others == 1 && mine > 0 => Decision::DownUnreachable,
                (false, _) => Decision::DownReachable,
            }
        }
        DowningStrategyKind::StaticQuorum { quorum_size } => {
            let q = *quorum_size;
            if mine >= q {
                if others >= q {
                    tie_break(settings.tie_break, view)
                } else {
                    Decision::DownUnreachable
                }
            } else if others < q && settings.down_all_when_unstable {
                Decision::DownAll
            } else {
                Decision::DownReachable
            }
        }
        DowningStrategyKind::KeepReferee {
            address,
            down_if_alone,
        } => {
            let referee_is_mine = view
                .considered()
                .any(|m| m.node.address() == address && !view.unreachable.contains(&m.node));
            if !referee_is_mine {
                Decision::DownReachable
            } else if *down_if_alone && mine == 1 && others > 0 {
                Decision::DownAll
            } else {
                Decision::DownUnreachable
            }
        }
        DowningStrategyKind::DownAll => Decision::DownAll,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemberStatus;
    use crate::NodeAddress;

    fn node(port: u16) -> UniqueAddress {
        UniqueAddress::new(NodeAddress::new("127.0.0.1", port), 1)
    }

    /// Members 1..=n, Up, ordinal equal to the port (so 1 is the oldest).
    fn members(n: u16) -> Vec<Member> {
        (1..=n)
            .map(|p| {
                let mut m = Member::joining(node(p), BTreeSet::new());
                m.status = MemberStatus::Up;
                m.ordinal = Some(u64::from(p));
                m
            })
            .collect()
    }

    fn view(n: u16, me: u16, unreachable: &[u16]) -> PartitionView {
        PartitionView::new(
            node(me),
            members(n),
            unreachable.iter().map(|p| node(*p)).collect(),
        )
    }

    fn settings(strategy: DowningStrategyKind) -> DowningSettings {
        DowningSettings {
            strategy,
            ..DowningSettings::default()
        }
    }

    #[test]
    fn test_sides() {
        let v = view(5, 1, &[4, 5]);
        assert_eq!(v.my_side(), BTreeSet::from([node(1), node(2), node(3)]));
        assert_eq!(v.other_side(), BTreeSet::from([node(4), node(5)]));
        assert_eq!(
            v.nodes_to_down(Decision::DownUnreachable),
            vec![node(4), node(5)]
        );
        assert_eq!(
            v.nodes_to_down(Decision::DownReachable),
            vec![node(1), node(2), node(3)]
        );
        assert_eq!(v.nodes_to_down(Decision::DownAll).len(), 5);
        assert!(v.nodes_to_down(Decision::NoAction).is_empty());
    }

    #[test]
    fn test_keep_majority_tie_without_down_all_takes_no_action() {
        let mut s = settings(DowningStrategyKind::KeepMajority);
        s.down_all_when_unstable = false;
        // the tie-break only settles static quorum splits
        for tie_break in [TieBreak::LowestAddress, TieBreak::DownAll, TieBreak::NoAction] {
            s.tie_break = tie_break;
            assert_eq!(decide(&s, &view(4, 1, &[3, 4])), Decision::NoAction);
            assert_eq!(decide(&s, &view(4, 3, &[1, 2])), Decision::NoAction);
            assert_eq!(decide(&s, &view(6, 1, &[4, 5, 6])), Decision::NoAction);
            assert_eq!(decide(&s, &view(6, 4, &[1, 2, 3])), Decision::NoAction);
        }
        // a strict majority still wins
        assert_eq!(decide(&s, &view(5, 1, &[4, 5])), Decision::DownUnreachable);
        assert_eq!(decide(&s, &view(5, 4, &[1, 2, 3])), Decision::DownReachable);
    }

    #[test]
    fn test_keep_majority_counts_only_up_and_leaving() {
        let s = settings(DowningStrategyKind::KeepMajority);
        let mut ms = members(4);
        ms[3].status = MemberStatus::Joining;
        // 1,2 vs 3 (4 is joining and unreachable, does not count)
        let v = PartitionView::new(node(1), ms, BTreeSet::from([node(3), node(4)]));
        assert_eq!(decide(&s, &v), Decision::DownUnreachable);
        assert_eq!(v.nodes_to_down(Decision::DownUnreachable), vec![node(3), node(4)]);
    }

    #[test]
    fn test_keep_oldest_down_if_alone() {
        let s = settings(DowningStrategyKind::KeepOldest {
            down_if_alone: true,
        });
        // oldest (1) alone against 2..=5
        assert_eq!(decide(&s, &view(5, 1, &[2, 3, 4, 5])), Decision::DownReachable);
        assert_eq!(decide(&s, &view(5, 2, &[1])), Decision::DownUnreachable);

        let s = settings(DowningStrategyKind::KeepOldest {
            down_if_alone: false,
        });
        assert_eq!(decide(&s, &view(5, 1, &[2, 3, 4, 5])), Decision::DownUnreachable);
        assert_eq!(decide(&s, &view(5, 2, &[1])), Decision::DownReachable);
    }

    #[test]
    fn test_static_quorum_both_sides_qualify_uses_tie_break() {
        let s = settings(DowningStrategyKind::StaticQuorum { quorum_size: 2 });
        assert_eq!(decide(&s, &view(4, 1, &[3, 4])), Decision::DownUnreachable);
        assert_eq!(decide(&s, &view(4, 4, &[1, 2])), Decision::DownReachable);
    }

    #[test]
    fn test_keep_referee() {
        let s = settings(DowningStrategyKind::KeepReferee {
            address: NodeAddress::new("127.0.0.1", 3),
            down_if_alone: true,
        });
        assert_eq!(decide(&s, &view(5, 3, &[1, 2])), Decision::DownUnreachable);
        assert_eq!(decide(&s, &view(5, 1, &[3, 4, 5])), Decision::DownReachable);
        assert_eq!(decide(&s, &view(5, 3, &[1, 2, 4, 5])), Decision::DownAll);
    }

    #[test]
    fn test_same_side_same_decision() {
        let strategies = [
            DowningStrategyKind::KeepMajority,
            DowningStrategyKind::KeepOldest {
                down_if_alone: false,
            },
            DowningStrategyKind::StaticQuorum { quorum_size: 3 },
        ];
        for strategy in strategies {
            let s = settings(strategy);
            let majority: Vec<_> = [1, 2, 3]
                .iter()
                .map(|me| {
                    let v = view(5, *me, &[4, 5]);
                    let decision = decide(&s, &v);
                    (decision, v.nodes_to_down(decision))
                })
                .collect();
            assert!(majority.windows(2).all(|w| w[0] == w[1]), "{majority:?}");
            assert_eq!(majority[0], (Decision::DownUnreachable, vec![node(4), node(5)]));

            let minority: Vec<_> = [4, 5]
                .iter()
                .map(|me| decide(&s, &view(5, *me, &[1, 2, 3])))
                .collect();
            assert_eq!(minority, vec![Decision::DownReachable; 2]);
        }
    }

    #[test]
    fn test_keep_majority_literal_splits() {
        let s = settings(DowningStrategyKind::KeepMajority);
        assert_eq!(decide(&s, &view(6, 1, &[4, 5, 6])), Decision::DownAll);
        assert_eq!(decide(&s, &view(6, 4, &[1, 2, 3])), Decision::DownAll);
        assert_eq!(decide(&s, &view(5, 5, &[1, 2, 3, 4])), Decision::DownReachable);
        assert_eq!(decide(&s, &view(5, 1, &[5])), Decision::DownUnreachable);
    }

    #[test]
    fn test_down_all() {
        let s = settings(DowningStrategyKind::DownAll);
        assert_eq!(decide(&s, &view(5, 1, &[5])), Decision::DownAll);
    }
}
