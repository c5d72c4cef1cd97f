//! The singleton manager.
//!
//! Every node runs one manager per singleton name. Only the manager on the
//! oldest `Up` member (holding the singleton role, if any) hosts the
//! instance, and it only starts after the previous host has stopped:
//!
//! - **handover**: the new oldest sends `HandOverToMe` to the previous host
//!   (retrying with exponential backoff for as long as that host is a live
//!   member); the previous host answers `HandOverInProgress`, stops its
//!   instance, then answers `HandOverDone`.
//! - **failure**: when the previous host is `Down` or gone, the new oldest
//!   waits `min_handover_retries × retry_interval` before starting.
//! - **leave**: a leaving host nudges its successor with `TakeOverFromMe`.
//!
//! Each start uses a generation one above the highest generation the
//! manager has heard of.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::component::{Component, ComponentId, Input, LocalEvent, Outbox};
use crate::config::SingletonSettings;
use crate::events::ClusterEvent;
use crate::membership::{ClusterState, MemberStatus};
use crate::protocol::{ClusterMessage, SingletonMessage};
use crate::UniqueAddress;

/// Manager state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerPhase {
    /// Not hosting and not about to.
    Idle,
    /// Oldest; asking `previous` to hand over.
    AwaitingHandover {
        /// Previous host candidate.
        previous: UniqueAddress,
        /// When to retry `HandOverToMe`.
        next_attempt: Duration,
        /// Current retry backoff.
        backoff: Duration,
    },
    /// Oldest; the previous host failed, waiting out the grace window.
    AwaitingGrace {
        /// End of the grace window.
        until: Duration,
    },
    /// Hosting `generation`.
    Active {
        /// Hosted generation.
        generation: u64,
    },
    /// Waiting for the instance to stop.
    Stopping {
        /// Generation being stopped.
        generation: u64,
        /// Node to send `HandOverDone` to once stopped.
        successor: Option<UniqueAddress>,
    },
}

/// Singleton manager component.
pub struct SingletonManager {
    name: String,
    settings: SingletonSettings,
    self_node: UniqueAddress,
    state: Option<Arc<ClusterState>>,
    phase: ManagerPhase,
    known_generation: u64,
    previous_oldest: Option<UniqueAddress>,
    last_announce: Option<Duration>,
    last_takeover: Option<Duration>,
    drained: bool,
    self_down: bool,
}

impl SingletonManager {
    /// Create a manager for singleton `name`.
    pub fn new(name: impl Into<String>, settings: SingletonSettings, self_node: UniqueAddress) -> Self {
        Self {
            name: name.into(),
            settings,
            self_node,
            state: None,
            phase: ManagerPhase::Idle,
            known_generation: 0,
            previous_oldest: None,
            last_announce: None,
            last_takeover: None,
            drained: false,
            self_down: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> &ManagerPhase {
        &self.phase
    }

    /// Highest generation heard of.
    pub fn known_generation(&self) -> u64 {
        self.known_generation
    }

    fn send(&self, to: &UniqueAddress, message: SingletonMessage, out: &mut Outbox) {
        out.send(
            to,
            ClusterMessage::Singleton {
                name: self.name.clone(),
                message,
            },
        );
    }

    fn oldest(&self) -> Option<UniqueAddress> {
        self.state
            .as_ref()
            .and_then(|s| s.oldest_with_role(self.settings.role.as_deref()))
    }

    fn is_oldest(&self) -> bool {
        self.oldest().as_ref() == Some(&self.self_node)
    }

    fn is_alive(&self, node: &UniqueAddress) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_alive(node))
    }

    fn learn_generation(&mut self, generation: u64) {
        self.known_generation = self.known_generation.max(generation);
    }

    // ---------------------------------------------------------------------
    // Becoming oldest
    // ---------------------------------------------------------------------

    /// Decide how to take over once this node is the oldest.
    fn become_oldest(&mut self, now: Duration, out: &mut Outbox) {
        let Some(state) = self.state.clone() else {
            return;
        };
        let role = self.settings.role.as_deref();
        let my_age = state.self_member().map(|m| m.age_key());
        // older members may still host the instance
        let older: Vec<_> = state
            .members
            .iter()
            .filter(|m| m.node != self.self_node && m.has_role(role))
            .filter(|m| my_age.as_ref().is_some_and(|mine| m.age_key() < *mine))
            .collect();
        let live_previous = older
            .iter()
            .filter(|m| !m.status.is_terminal())
            .min_by(|a, b| a.age_key().cmp(&b.age_key()))
            .map(|m| m.node.clone());
        let failed_previous = older.iter().any(|m| m.status == MemberStatus::Down)
            || self
                .previous_oldest
                .as_ref()
                .is_some_and(|p| *p != self.self_node && !state.is_alive(p));

        if let Some(previous) = live_previous {
            info!(singleton = %self.name, previous = %previous, "oldest member, requesting handover");
            self.request_handover(now, previous, self.settings.retry_interval, out);
        } else if failed_previous {
            let grace = self.settings.handover_grace();
            info!(singleton = %self.name, ?grace, "previous host failed, waiting grace window");
            self.phase = ManagerPhase::AwaitingGrace { until: now + grace };
        } else {
            self.start(now, out);
        }
    }

    fn request_handover(
        &mut self,
        now: Duration,
        previous: UniqueAddress,
        backoff: Duration,
        out: &mut Outbox,
    ) {
        self.send(&previous, SingletonMessage::HandOverToMe, out);
        self.phase = ManagerPhase::AwaitingHandover {
            previous,
            next_attempt: now + backoff,
            backoff,
        };
    }

    fn start(&mut self, now: Duration, out: &mut Outbox) {
        let generation = self.known_generation + 1;
        self.known_generation = generation;
        info!(singleton = %self.name, node = %self.self_node, generation, "starting singleton");
        self.phase = ManagerPhase::Active { generation };
        out.local(LocalEvent::InstanceStart {
            name: self.name.clone(),
            generation,
        });
        out.event(ClusterEvent::SingletonStarted {
            name: self.name.clone(),
            generation,
        });
        self.announce(now, generation, out);
    }

    fn announce(&mut self, now: Duration, generation: u64, out: &mut Outbox) {
        self.last_announce = Some(now);
        let Some(state) = &self.state else {
            return;
        };
        for member in state.members.iter().filter(|m| !m.status.is_terminal()) {
            self.send(&member.node, SingletonMessage::Announce { generation }, out);
        }
    }

    fn stop(&mut self, successor: Option<UniqueAddress>, out: &mut Outbox) {
        let ManagerPhase::Active { generation } = self.phase else {
            return;
        };
        info!(
            singleton = %self.name,
            generation,
            successor = ?successor.as_ref().map(ToString::to_string),
            "stopping singleton"
        );
        self.phase = ManagerPhase::Stopping {
            generation,
            successor,
        };
        out.local(LocalEvent::InstanceStop {
            name: self.name.clone(),
        });
    }

    // ---------------------------------------------------------------------
    // Inputs
    // ---------------------------------------------------------------------

    fn on_membership(&mut self, now: Duration, state: Arc<ClusterState>, out: &mut Outbox) {
        let was_oldest = self.is_oldest();
        let previous_oldest = self.oldest();
        self.state = Some(state.clone());

        if matches!(
            state.self_status(),
            MemberStatus::Down | MemberStatus::Removed
        ) {
            if !self.self_down {
                warn!(singleton = %self.name, "node downed, giving up singleton");
                self.self_down = true;
            }
            match self.phase {
                ManagerPhase::Active { .. } => self.stop(None, out),
                ManagerPhase::AwaitingHandover { .. } | ManagerPhase::AwaitingGrace { .. } => {
                    self.phase = ManagerPhase::Idle;
                }
                _ => {}
            }
            return;
        }

        let now_oldest = self.is_oldest();
        if now_oldest && !was_oldest {
            self.previous_oldest = previous_oldest;
            if self.phase == ManagerPhase::Idle {
                self.become_oldest(now, out);
            }
        } else if !now_oldest {
            if matches!(
                self.phase,
                ManagerPhase::AwaitingHandover { .. } | ManagerPhase::AwaitingGrace { .. }
            ) {
                debug!(singleton = %self.name, "no longer oldest, abandoning takeover");
                self.phase = ManagerPhase::Idle;
            }
        }

        if let ManagerPhase::AwaitingHandover { previous, .. } = &self.phase {
            if !state.is_alive(previous) {
                let grace = self.settings.handover_grace();
                info!(singleton = %self.name, previous = %previous, "previous host downed during handover, waiting grace window");
                self.phase = ManagerPhase::AwaitingGrace { until: now + grace };
            }
        }
        self.check_drained(out);
    }

    fn on_tick(&mut self, now: Duration, out: &mut Outbox) {
        match self.phase.clone() {
            ManagerPhase::AwaitingHandover {
                previous,
                next_attempt,
                backoff,
            } if now >= next_attempt => {
                let backoff = (backoff * 2).min(self.settings.max_backoff);
                debug!(singleton = %self.name, previous = %previous, ?backoff, "retrying handover request");
                self.request_handover(now, previous, backoff, out);
            }
            ManagerPhase::AwaitingGrace { until } if now >= until => {
                if self.is_oldest() {
                    self.start(now, out);
                } else {
                    self.phase = ManagerPhase::Idle;
                }
            }
            ManagerPhase::Active { generation } => {
                let announce_due = self.last_announce.map_or(true, |last| {
                    now.saturating_sub(last) >= self.settings.announce_interval
                });
                if announce_due {
                    self.announce(now, generation, out);
                }
                if !self.is_oldest() {
                    self.hand_over_on_leave(now, out);
                }
            }
            _ => {}
        }
    }

    /// Active but no longer the oldest: nudge the successor, or stop when
    /// there is none.
    fn hand_over_on_leave(&mut self, now: Duration, out: &mut Outbox) {
        match self.oldest() {
            Some(successor) => {
                let due = self.last_takeover.map_or(true, |last| {
                    now.saturating_sub(last) >= self.settings.retry_interval
                });
                if due {
                    debug!(singleton = %self.name, successor = %successor, "asking successor to take over");
                    self.last_takeover = Some(now);
                    self.send(&successor, SingletonMessage::TakeOverFromMe, out);
                }
            }
            None => {
                let leaving = self.state.as_ref().is_some_and(|s| {
                    matches!(
                        s.self_status(),
                        MemberStatus::Leaving | MemberStatus::Exiting
                    )
                });
                if leaving {
                    self.stop(None, out);
                }
            }
        }
    }

    fn on_message(&mut self, now: Duration, from: UniqueAddress, message: SingletonMessage, out: &mut Outbox) {
        match message {
            SingletonMessage::HandOverToMe => match &mut self.phase {
                ManagerPhase::Active { .. } => {
                    self.send(&from, SingletonMessage::HandOverInProgress, out);
                    self.stop(Some(from), out);
                }
                ManagerPhase::Stopping { successor, .. } => {
                    *successor = Some(from.clone());
                    self.send(&from, SingletonMessage::HandOverInProgress, out);
                }
                _ => {
                    let generation = self.known_generation;
                    self.send(&from, SingletonMessage::HandOverDone { generation }, out);
                }
            },
            SingletonMessage::HandOverInProgress => {
                debug!(singleton = %self.name, from = %from, "previous host is stopping");
            }
            SingletonMessage::HandOverDone { generation } => {
                self.learn_generation(generation);
                let expected = matches!(
                    &self.phase,
                    ManagerPhase::AwaitingHandover { previous, .. } if *previous == from
                );
                if expected && self.is_oldest() {
                    self.start(now, out);
                }
            }
            SingletonMessage::TakeOverFromMe => {
                if !self.is_oldest() || self.self_down {
                    return;
                }
                match self.phase {
                    ManagerPhase::Idle | ManagerPhase::AwaitingGrace { .. } => {
                        info!(singleton = %self.name, previous = %from, "asked to take over");
                        self.request_handover(now, from, self.settings.retry_interval, out);
                    }
                    ManagerPhase::AwaitingHandover { .. } => {
                        self.send(&from, SingletonMessage::HandOverToMe, out);
                    }
                    _ => {}
                }
            }
            SingletonMessage::Announce { generation } => self.learn_generation(generation),
            SingletonMessage::Identify => {
                let generation = match self.phase {
                    ManagerPhase::Active { generation } => Some(generation),
                    _ => None,
                };
                self.send(&from, SingletonMessage::Identity { generation }, out);
            }
            SingletonMessage::Deliver(envelope) => match self.phase {
                ManagerPhase::Active { .. } => out.local(LocalEvent::InstanceDeliver {
                    name: self.name.clone(),
                    envelope,
                }),
                _ => {
                    debug!(singleton = %self.name, from = %from, "not hosting, bouncing message");
                    self.send(&from, SingletonMessage::Bounced(envelope), out);
                }
            },
            SingletonMessage::Identity { .. } | SingletonMessage::Bounced(_) => {}
        }
    }

    fn on_stopped(&mut self, out: &mut Outbox) {
        let ManagerPhase::Stopping {
            generation,
            successor,
        } = self.phase.clone()
        else {
            return;
        };
        info!(singleton = %self.name, generation, "singleton stopped");
        out.event(ClusterEvent::SingletonStopped {
            name: self.name.clone(),
            generation,
        });
        if let Some(successor) = successor {
            self.send(&successor, SingletonMessage::HandOverDone { generation }, out);
        }
        self.phase = ManagerPhase::Idle;
        self.check_drained(out);
    }

    fn check_drained(&mut self, out: &mut Outbox) {
        if self.drained || self.phase != ManagerPhase::Idle {
            return;
        }
        let leaving = self.state.as_ref().is_some_and(|s| {
            matches!(
                s.self_status(),
                MemberStatus::Leaving | MemberStatus::Exiting
            )
        });
        if leaving {
            debug!(singleton = %self.name, "singleton manager drained");
            self.drained = true;
            out.local(LocalEvent::Drained(ComponentId::SingletonManager(
                self.name.clone(),
            )));
        }
    }
}

impl Component for SingletonManager {
    fn id(&self) -> ComponentId {
        ComponentId::SingletonManager(self.name.clone())
    }

    fn handle(&mut self, now: Duration, input: Input, out: &mut Outbox) {
        match input {
            Input::Local(LocalEvent::MembershipChanged(state)) => self.on_membership(now, state, out),
            Input::Local(LocalEvent::InstanceStopped { name }) if name == self.name => {
                self.on_stopped(out);
            }
            Input::Remote {
                from,
                message: ClusterMessage::Singleton { message, .. },
            } => {
                if !self.is_alive(&from) && !matches!(message, SingletonMessage::Deliver(_)) {
                    debug!(singleton = %self.name, from = %from, "ignoring singleton message from non-member");
                    return;
                }
                self.on_message(now, from, message, out);
            }
            Input::Tick if !self.self_down => self.on_tick(now, out),
            _ => {}
        }
    }
}
