//! Cluster settings.
//!
//! [`ClusterSettings`] groups one settings struct per component. Every
//! struct has production defaults via [`Default`] and a `for_simulation()`
//! preset with short intervals, suited to virtual time.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use moonpool_cluster::{ClusterSettings, DowningStrategyKind, NodeAddress};
//!
//! let settings = ClusterSettings::builder()
//!     .seed_node(NodeAddress::new("10.0.0.1", 2552))
//!     .strategy(DowningStrategyKind::StaticQuorum { quorum_size: 3 })
//!     .stable_after(Duration::from_secs(20))
//!     .number_of_shards(100)
//!     .build()
//!     .expect("valid settings");
//! assert_eq!(settings.sharding.number_of_shards, 100);
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::NodeAddress;

/// Errors from validating [`ClusterSettings`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `number_of_shards` must be at least 1.
    #[error("number_of_shards must be greater than zero")]
    ZeroShards,

    /// A bounded buffer was configured with zero capacity.
    #[error("{name} must be greater than zero")]
    ZeroBuffer {
        /// Name of the offending setting.
        name: &'static str,
    },

    /// A duration setting that drives a timer was zero.
    #[error("{name} must be a non-zero duration")]
    ZeroDuration {
        /// Name of the offending setting.
        name: &'static str,
    },

    /// The phi threshold must be strictly positive.
    #[error("failure detector threshold must be positive, got {threshold}")]
    InvalidThreshold {
        /// The rejected threshold.
        threshold: String,
    },

    /// A static quorum of zero members can never be meaningful.
    #[error("static quorum size must be greater than zero")]
    ZeroQuorum,

    /// `handoff_concurrency` must allow at least one handoff.
    #[error("handoff_concurrency must be greater than zero")]
    ZeroHandoffConcurrency,

    /// The keep-referee strategy needs the referee's address.
    #[error("keep-referee strategy requires a referee address")]
    MissingReferee,
}

/// Gossip and leader-action timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipSettings {
    /// Interval between gossip rounds.
    pub gossip_interval: Duration,
    /// Interval between leader action passes.
    pub leader_actions_interval: Duration,
    /// How long the first seed waits for another seed before joining itself.
    pub seed_node_timeout: Duration,
    /// Interval between join attempts against the seed list.
    pub retry_unsuccessful_join_after: Duration,
    /// How long a removed member's tombstone is kept before pruning.
    pub prune_grace: Duration,
    /// Promote joining members to `WeaklyUp` while convergence is blocked.
    pub allow_weakly_up: bool,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(1),
            leader_actions_interval: Duration::from_secs(1),
            seed_node_timeout: Duration::from_secs(5),
            retry_unsuccessful_join_after: Duration::from_secs(10),
            prune_grace: Duration::from_secs(6 * 60 * 60),
            allow_weakly_up: true,
        }
    }
}

impl GossipSettings {
    /// Short intervals for simulated time.
    pub fn for_simulation() -> Self {
        Self {
            gossip_interval: Duration::from_millis(100),
            leader_actions_interval: Duration::from_millis(100),
            seed_node_timeout: Duration::from_millis(500),
            retry_unsuccessful_join_after: Duration::from_millis(500),
            prune_grace: Duration::from_secs(60),
            allow_weakly_up: true,
        }
    }
}

/// Phi-accrual failure detector and heartbeat settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetectorSettings {
    /// Interval between heartbeats to each monitored node.
    pub heartbeat_interval: Duration,
    /// Phi value above which a link is considered unreachable.
    pub threshold: f64,
    /// Number of inter-arrival samples kept per link.
    pub max_sample_size: usize,
    /// Lower bound on the standard deviation used in the phi computation.
    pub min_std_deviation: Duration,
    /// Pause tolerated on top of the observed mean before suspicion rises.
    pub acceptable_heartbeat_pause: Duration,
    /// Mean assumed before any real heartbeat sample exists.
    pub first_heartbeat_estimate: Duration,
    /// How many ring successors each node monitors.
    pub monitored_by_nr_of_members: usize,
}

impl Default for FailureDetectorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            threshold: 8.0,
            max_sample_size: 1000,
            min_std_deviation: Duration::from_millis(100),
            acceptable_heartbeat_pause: Duration::from_secs(3),
            first_heartbeat_estimate: Duration::from_secs(1),
            monitored_by_nr_of_members: 9,
        }
    }
}

impl FailureDetectorSettings {
    /// Short intervals for simulated time.
    pub fn for_simulation() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            threshold: 8.0,
            max_sample_size: 200,
            min_std_deviation: Duration::from_millis(20),
            acceptable_heartbeat_pause: Duration::from_millis(300),
            first_heartbeat_estimate: Duration::from_millis(100),
            monitored_by_nr_of_members: 5,
        }
    }
}

/// Which split-brain strategy decides what to down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DowningStrategyKind {
    /// The side with a strict majority of the members survives.
    KeepMajority,
    /// The side holding the oldest member survives.
    KeepOldest {
        /// Down the oldest too when it is cut off alone.
        down_if_alone: bool,
    },
    /// A side survives only when it has at least `quorum_size` members.
    StaticQuorum {
        /// Minimum number of members for a side to survive.
        quorum_size: usize,
    },
    /// The side holding the referee address survives.
    KeepReferee {
        /// Address of the referee node.
        address: NodeAddress,
        /// Down everything when the referee is cut off alone.
        down_if_alone: bool,
    },
    /// Every detected split downs every node.
    DownAll,
}

/// How to settle two sides that are equally eligible to survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    /// The side holding the lowest member address survives.
    LowestAddress,
    /// Both sides are downed.
    DownAll,
    /// No decision is taken.
    NoAction,
}

/// Split-brain resolver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowningSettings {
    /// How long the unreachable set must stay unchanged before deciding.
    pub stable_after: Duration,
    /// The strategy to apply.
    pub strategy: DowningStrategyKind,
    /// Down every node when no side can be chosen safely, such as an
    /// exact `KeepMajority` tie. When unset such a split is left alone.
    pub down_all_when_unstable: bool,
    /// Tie-break between `StaticQuorum` sides that both reach the quorum.
    pub tie_break: TieBreak,
}

impl Default for DowningSettings {
    fn default() -> Self {
        Self {
            stable_after: Duration::from_secs(20),
            strategy: DowningStrategyKind::KeepMajority,
            down_all_when_unstable: true,
            tie_break: TieBreak::LowestAddress,
        }
    }
}

impl DowningSettings {
    /// Short stability window for simulated time.
    pub fn for_simulation() -> Self {
        Self {
            stable_after: Duration::from_secs(2),
            ..Self::default()
        }
    }
}

/// Shard coordinator and region settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingSettings {
    /// Fixed number of shards per entity type.
    pub number_of_shards: u32,
    /// Maximum number of handoffs in flight at once.
    pub handoff_concurrency: usize,
    /// Interval between rebalance passes.
    pub rebalance_interval: Duration,
    /// Minimum shard-count spread between regions before rebalancing.
    pub rebalance_threshold: usize,
    /// Interval between registration and shard-home retries.
    pub retry_interval: Duration,
    /// Total buffered messages per region before rejecting.
    pub buffer_size: usize,
    /// Timeout for each handoff step.
    pub handoff_timeout: Duration,
    /// Retries of a handoff step before the shard is blocked.
    pub handoff_retries: u32,
    /// Passivate entities idle for this long.
    pub passivate_idle_after: Option<Duration>,
    /// Only members with this role host entities.
    pub role: Option<String>,
}

impl Default for ShardingSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 100,
            handoff_concurrency: 3,
            rebalance_interval: Duration::from_secs(10),
            rebalance_threshold: 1,
            retry_interval: Duration::from_secs(2),
            buffer_size: 100_000,
            handoff_timeout: Duration::from_secs(10),
            handoff_retries: 3,
            passivate_idle_after: Some(Duration::from_secs(120)),
            role: None,
        }
    }
}

impl ShardingSettings {
    /// Short intervals for simulated time.
    pub fn for_simulation() -> Self {
        Self {
            number_of_shards: 10,
            handoff_concurrency: 3,
            rebalance_interval: Duration::from_millis(500),
            rebalance_threshold: 1,
            retry_interval: Duration::from_millis(200),
            buffer_size: 1000,
            handoff_timeout: Duration::from_secs(1),
            handoff_retries: 3,
            passivate_idle_after: None,
            role: None,
        }
    }

    /// Check the sharding values on their own; used for per-type overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("retry_interval", self.retry_interval),
            ("handoff_timeout", self.handoff_timeout),
            ("rebalance_interval", self.rebalance_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        if self.number_of_shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        if self.handoff_concurrency == 0 {
            return Err(ConfigError::ZeroHandoffConcurrency);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBuffer {
                name: "sharding buffer_size",
            });
        }
        Ok(())
    }
}

/// Singleton manager and proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingletonSettings {
    /// Base interval between handover retries.
    pub retry_interval: Duration,
    /// Retries that make up the grace window after the previous host is downed.
    pub min_handover_retries: u32,
    /// Upper bound for the handover retry backoff.
    pub max_backoff: Duration,
    /// Proxy buffer capacity; the oldest message is dropped on overflow.
    pub buffer_size: usize,
    /// Interval between proxy identify attempts while the host is unknown.
    pub identify_interval: Duration,
    /// Interval between host announcements.
    pub announce_interval: Duration,
    /// Only members with this role can host singletons.
    pub role: Option<String>,
}

impl Default for SingletonSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            min_handover_retries: 15,
            max_backoff: Duration::from_secs(10),
            buffer_size: 1000,
            identify_interval: Duration::from_secs(1),
            announce_interval: Duration::from_secs(5),
            role: None,
        }
    }
}

impl SingletonSettings {
    /// Short intervals for simulated time.
    pub fn for_simulation() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
            min_handover_retries: 10,
            max_backoff: Duration::from_secs(1),
            buffer_size: 100,
            identify_interval: Duration::from_millis(100),
            announce_interval: Duration::from_millis(500),
            role: None,
        }
    }

    /// Grace window after the previous host is downed.
    pub fn handover_grace(&self) -> Duration {
        self.retry_interval * self.min_handover_retries
    }
}

/// Router settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Upper bound on how long an ask waits for its reply.
    pub ask_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            ask_timeout: Duration::from_secs(5),
        }
    }
}

impl RouterSettings {
    /// Short timeout for simulated time.
    pub fn for_simulation() -> Self {
        Self {
            ask_timeout: Duration::from_secs(2),
        }
    }
}

/// Settings for one cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Seed addresses used for the initial contact.
    pub seed_nodes: Vec<NodeAddress>,
    /// Roles this node advertises.
    pub roles: BTreeSet<String>,
    /// Granularity of the timer tick driving every component.
    pub tick_interval: Duration,
    /// Gossip settings.
    pub gossip: GossipSettings,
    /// Failure detector settings.
    pub failure_detector: FailureDetectorSettings,
    /// Split-brain resolver settings.
    pub downing: DowningSettings,
    /// Sharding settings.
    pub sharding: ShardingSettings,
    /// Singleton settings.
    pub singleton: SingletonSettings,
    /// Router settings.
    pub router: RouterSettings,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            roles: BTreeSet::new(),
            tick_interval: Duration::from_millis(100),
            gossip: GossipSettings::default(),
            failure_detector: FailureDetectorSettings::default(),
            downing: DowningSettings::default(),
            sharding: ShardingSettings::default(),
            singleton: SingletonSettings::default(),
            router: RouterSettings::default(),
        }
    }
}

impl ClusterSettings {
    /// Start building settings from the production defaults.
    pub fn builder() -> ClusterSettingsBuilder {
        ClusterSettingsBuilder {
            settings: Self::default(),
        }
    }

    /// Settings for simulated time, with every interval shortened.
    pub fn for_simulation() -> Self {
        Self {
            seed_nodes: Vec::new(),
            roles: BTreeSet::new(),
            tick_interval: Duration::from_millis(10),
            gossip: GossipSettings::for_simulation(),
            failure_detector: FailureDetectorSettings::for_simulation(),
            downing: DowningSettings::for_simulation(),
            sharding: ShardingSettings::for_simulation(),
            singleton: SingletonSettings::for_simulation(),
            router: RouterSettings::for_simulation(),
        }
    }

    /// Check the settings for values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timers = [
            ("tick_interval", self.tick_interval),
            ("gossip_interval", self.gossip.gossip_interval),
            ("leader_actions_interval", self.gossip.leader_actions_interval),
            ("heartbeat_interval", self.failure_detector.heartbeat_interval),
            ("stable_after", self.downing.stable_after),
            ("singleton retry_interval", self.singleton.retry_interval),
            ("ask_timeout", self.router.ask_timeout),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        if self.failure_detector.threshold.is_nan() || self.failure_detector.threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold {
                threshold: self.failure_detector.threshold.to_string(),
            });
        }
        self.sharding.validate()?;
        if self.singleton.buffer_size == 0 {
            return Err(ConfigError::ZeroBuffer {
                name: "singleton buffer_size",
            });
        }
        match &self.downing.strategy {
            DowningStrategyKind::StaticQuorum { quorum_size: 0 } => {
                return Err(ConfigError::ZeroQuorum);
            }
            DowningStrategyKind::KeepReferee { address, .. } if address.host().is_empty() => {
                return Err(ConfigError::MissingReferee);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Builder for [`ClusterSettings`].
#[derive(Debug, Clone)]
pub struct ClusterSettingsBuilder {
    settings: ClusterSettings,
}

impl ClusterSettingsBuilder {
    /// Start from an existing settings value (e.g. [`ClusterSettings::for_simulation`]).
    pub fn from_settings(settings: ClusterSettings) -> Self {
        Self { settings }
    }

    /// Add a seed node.
    pub fn seed_node(mut self, address: NodeAddress) -> Self {
        self.settings.seed_nodes.push(address);
        self
    }

    /// Replace the seed list.
    pub fn seed_nodes(mut self, seeds: impl IntoIterator<Item = NodeAddress>) -> Self {
        self.settings.seed_nodes = seeds.into_iter().collect();
        self
    }

    /// Add a role to this node.
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.settings.roles.insert(role.into());
        self
    }

    /// Set the split-brain strategy.
    pub fn strategy(mut self, strategy: DowningStrategyKind) -> Self {
        self.settings.downing.strategy = strategy;
        self
    }

    /// Set the resolver stability window.
    pub fn stable_after(mut self, stable_after: Duration) -> Self {
        self.settings.downing.stable_after = stable_after;
        self
    }

    /// Set `down_all_when_unstable`.
    pub fn down_all_when_unstable(mut self, enabled: bool) -> Self {
        self.settings.downing.down_all_when_unstable = enabled;
        self
    }

    /// Set the tie-break between equally eligible sides.
    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.settings.downing.tie_break = tie_break;
        self
    }

    /// Set the number of shards per entity type.
    pub fn number_of_shards(mut self, shards: u32) -> Self {
        self.settings.sharding.number_of_shards = shards;
        self
    }

    /// Set the concurrent handoff limit.
    pub fn handoff_concurrency(mut self, limit: usize) -> Self {
        self.settings.sharding.handoff_concurrency = limit;
        self
    }

    /// Set the singleton handover retry interval and count.
    pub fn handover_retries(mut self, retry_interval: Duration, min_retries: u32) -> Self {
        self.settings.singleton.retry_interval = retry_interval;
        self.settings.singleton.min_handover_retries = min_retries;
        self
    }

    /// Set the gossip interval.
    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.settings.gossip.gossip_interval = interval;
        self
    }

    /// Set the phi threshold.
    pub fn failure_detector_threshold(mut self, threshold: f64) -> Self {
        self.settings.failure_detector.threshold = threshold;
        self
    }

    /// Set the router ask timeout.
    pub fn ask_timeout(mut self, timeout: Duration) -> Self {
        self.settings.router.ask_timeout = timeout;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ClusterSettings, ConfigError> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ClusterSettings::default().validate().expect("defaults valid");
        ClusterSettings::for_simulation()
            .validate()
            .expect("simulation settings valid");
    }

    #[test]
    fn test_builder_sets_fields() {
        let settings = ClusterSettings::builder()
            .seed_node(NodeAddress::new("a", 1))
            .role("backend")
            .strategy(DowningStrategyKind::KeepOldest {
                down_if_alone: true,
            })
            .handoff_concurrency(5)
            .build()
            .expect("valid");
        assert_eq!(settings.seed_nodes, vec![NodeAddress::new("a", 1)]);
        assert!(settings.roles.contains("backend"));
        assert_eq!(settings.sharding.handoff_concurrency, 5);
    }

    #[test]
    fn test_builder_rejects_invalid_values() {
        assert_eq!(
            ClusterSettings::builder().number_of_shards(0).build(),
            Err(ConfigError::ZeroShards)
        );
        assert_eq!(
            ClusterSettings::builder()
                .strategy(DowningStrategyKind::StaticQuorum { quorum_size: 0 })
                .build(),
            Err(ConfigError::ZeroQuorum)
        );
        assert!(matches!(
            ClusterSettings::builder()
                .failure_detector_threshold(0.0)
                .build(),
            Err(ConfigError::InvalidThreshold { .. })
        ));
        assert_eq!(
            ClusterSettings::builder()
                .stable_after(Duration::ZERO)
                .build(),
            Err(ConfigError::ZeroDuration {
                name: "stable_after"
            })
        );
        assert_eq!(
            ClusterSettings::builder()
                .strategy(DowningStrategyKind::KeepReferee {
                    address: NodeAddress::new("", 2552),
                    down_if_alone: false,
                })
                .build(),
            Err(ConfigError::MissingReferee)
        );
    }

    #[test]
    fn test_handover_grace_window() {
        let settings = SingletonSettings {
            retry_interval: Duration::from_millis(200),
            min_handover_retries: 5,
            ..SingletonSettings::default()
        };
        assert_eq!(settings.handover_grace(), Duration::from_secs(1));
    }
}
