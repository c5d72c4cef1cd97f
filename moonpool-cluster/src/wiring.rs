//! Node assembly and message routing tables.
//!
//! [`NodeConfig`] describes one node: its address, settings, and the entity
//! types and singletons it runs. [`build`] turns it into the node's
//! components and a [`Wiring`], the table both drivers use to decide which
//! component consumes an inbound message or a local event.

use std::collections::{BTreeMap, BTreeSet};

use crate::component::{Component, ComponentId, LocalEvent};
use crate::config::{ClusterSettings, ShardingSettings};
use crate::downing::SplitBrainResolver;
use crate::error::ClusterError;
use crate::membership::MembershipService;
use crate::protocol::ClusterMessage;
use crate::router::Router;
use crate::sharding::{
    coordinator_singleton_name, EntityFactory, EvenShardAllocation, HashExtractor, ShardCoordinator,
    ShardRegion,
};
use crate::singleton::{SingletonFactory, SingletonHost, SingletonManager, SingletonProxy};
use crate::UniqueAddress;

/// A sharded entity type registered on a node.
#[derive(Clone)]
pub struct EntityTypeRegistration {
    /// Entity type name.
    pub type_name: String,
    /// Creates instances.
    pub factory: EntityFactory,
    /// Sharding settings for this type.
    pub settings: ShardingSettings,
}

/// A user singleton registered on a node.
#[derive(Clone)]
pub struct SingletonRegistration {
    /// Singleton name.
    pub name: String,
    /// Creates instances.
    pub factory: SingletonFactory,
}

/// Everything needed to start one node.
#[derive(Clone)]
pub struct NodeConfig {
    /// Address and incarnation of the node.
    pub address: UniqueAddress,
    /// Cluster settings.
    pub settings: ClusterSettings,
    /// Entity types hosted or routed by this node.
    pub entity_types: Vec<EntityTypeRegistration>,
    /// User singletons.
    pub singletons: Vec<SingletonRegistration>,
}

impl NodeConfig {
    /// Start a configuration for the node at `address`.
    pub fn builder(address: UniqueAddress, settings: ClusterSettings) -> NodeConfigBuilder {
        NodeConfigBuilder {
            config: NodeConfig {
                address,
                settings,
                entity_types: Vec::new(),
                singletons: Vec::new(),
            },
        }
    }

    /// The same node with a fresh incarnation, as after a restart.
    pub fn next_incarnation(&self) -> NodeConfig {
        NodeConfig {
            address: self.address.next_incarnation(),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<(), ClusterError> {
        self.settings.validate()?;
        let mut types = BTreeSet::new();
        let mut names = BTreeSet::new();
        for registration in &self.entity_types {
            registration.settings.validate()?;
            if !types.insert(registration.type_name.as_str()) {
                return Err(ClusterError::DuplicateEntityType {
                    type_name: registration.type_name.clone(),
                });
            }
            names.insert(coordinator_singleton_name(&registration.type_name));
        }
        for registration in &self.singletons {
            if !names.insert(registration.name.clone()) {
                return Err(ClusterError::DuplicateSingleton {
                    name: registration.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Builder for [`NodeConfig`].
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    /// Register an entity type using the cluster-wide sharding settings.
    pub fn entity_type(self, type_name: impl Into<String>, factory: EntityFactory) -> Self {
        let settings = self.config.settings.sharding.clone();
        self.entity_type_with_settings(type_name, factory, settings)
    }

    /// Register an entity type with its own sharding settings.
    pub fn entity_type_with_settings(
        mut self,
        type_name: impl Into<String>,
        factory: EntityFactory,
        settings: ShardingSettings,
    ) -> Self {
        self.config.entity_types.push(EntityTypeRegistration {
            type_name: type_name.into(),
            factory,
            settings,
        });
        self
    }

    /// Register a user singleton.
    pub fn singleton(mut self, name: impl Into<String>, factory: SingletonFactory) -> Self {
        self.config.singletons.push(SingletonRegistration {
            name: name.into(),
            factory,
        });
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<NodeConfig, ClusterError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Which component of a node consumes which message or event.
#[derive(Debug, Clone, Default)]
pub struct Wiring {
    entity_types: BTreeSet<String>,
    singletons: BTreeSet<String>,
    /// Coordinator singleton name to entity type.
    coordinators: BTreeMap<String, String>,
}

impl Wiring {
    fn from_config(config: &NodeConfig) -> Self {
        let mut wiring = Wiring::default();
        for registration in &config.entity_types {
            wiring.entity_types.insert(registration.type_name.clone());
            wiring.coordinators.insert(
                coordinator_singleton_name(&registration.type_name),
                registration.type_name.clone(),
            );
        }
        for registration in &config.singletons {
            wiring.singletons.insert(registration.name.clone());
        }
        wiring
    }

    fn has_manager(&self, name: &str) -> bool {
        self.singletons.contains(name) || self.coordinators.contains_key(name)
    }

    /// The component a singleton manager starts and stops.
    pub fn instance_of(&self, name: &str) -> Option<ComponentId> {
        if let Some(type_name) = self.coordinators.get(name) {
            return Some(ComponentId::Coordinator(type_name.clone()));
        }
        self.singletons
            .contains(name)
            .then(|| ComponentId::SingletonHost(name.to_string()))
    }

    /// Components whose graceful leave must complete before the node exits.
    pub fn drain_participants(&self) -> BTreeSet<ComponentId> {
        let regions = self.entity_types.iter().cloned().map(ComponentId::Region);
        let managers = self
            .singletons
            .iter()
            .chain(self.coordinators.keys())
            .cloned()
            .map(ComponentId::SingletonManager);
        regions.chain(managers).collect()
    }

    /// Consumers of a message received from the network.
    pub fn remote_targets(&self, message: &ClusterMessage) -> Vec<ComponentId> {
        match message {
            ClusterMessage::Membership(_) => vec![ComponentId::Membership],
            ClusterMessage::Sharding { type_name, message } => {
                if !self.entity_types.contains(type_name) {
                    return Vec::new();
                }
                if message.is_for_coordinator() {
                    vec![ComponentId::Coordinator(type_name.clone())]
                } else {
                    vec![ComponentId::Region(type_name.clone())]
                }
            }
            ClusterMessage::Singleton { name, message } => {
                let mut targets = Vec::new();
                if message.is_for_manager() && self.has_manager(name) {
                    targets.push(ComponentId::SingletonManager(name.clone()));
                }
                if message.is_for_proxy() && self.singletons.contains(name) {
                    targets.push(ComponentId::SingletonProxy(name.clone()));
                }
                targets
            }
            ClusterMessage::Reply { .. } => vec![ComponentId::Router],
        }
    }

    /// Consumers of a local event.
    pub fn local_targets(&self, event: &LocalEvent) -> Vec<ComponentId> {
        match event {
            LocalEvent::MembershipChanged(_) => {
                let mut targets = vec![ComponentId::Resolver];
                for type_name in &self.entity_types {
                    targets.push(ComponentId::Region(type_name.clone()));
                    targets.push(ComponentId::Coordinator(type_name.clone()));
                }
                for name in self.coordinators.keys() {
                    targets.push(ComponentId::SingletonManager(name.clone()));
                }
                for name in &self.singletons {
                    targets.push(ComponentId::SingletonManager(name.clone()));
                    targets.push(ComponentId::SingletonProxy(name.clone()));
                }
                targets
            }
            LocalEvent::DownMembers(_) | LocalEvent::Leave | LocalEvent::Drained(_) => {
                vec![ComponentId::Membership]
            }
            LocalEvent::InstanceStart { name, .. } | LocalEvent::InstanceStop { name } => {
                self.instance_of(name).into_iter().collect()
            }
            LocalEvent::InstanceStopped { name } if self.has_manager(name) => {
                vec![ComponentId::SingletonManager(name.clone())]
            }
            LocalEvent::InstanceDeliver { name, .. } if self.singletons.contains(name) => {
                vec![ComponentId::SingletonHost(name.clone())]
            }
            LocalEvent::RegionDeliver { type_name, .. } if self.entity_types.contains(type_name) => {
                vec![ComponentId::Region(type_name.clone())]
            }
            LocalEvent::ProxyDeliver { name, .. } if self.singletons.contains(name) => {
                vec![ComponentId::SingletonProxy(name.clone())]
            }
            LocalEvent::Ask { .. } => vec![ComponentId::Router],
            _ => Vec::new(),
        }
    }
}

/// Create the components of a node and the wiring between them.
///
/// Every node runs the membership service, the resolver and the router.
/// Each entity type adds a region, a coordinator and the singleton manager
/// that activates the coordinator on the oldest node with the sharding role.
/// Each user singleton adds a manager, a proxy and a host.
pub fn build(config: &NodeConfig) -> Result<(Wiring, Vec<Box<dyn Component>>), ClusterError> {
    config.validate()?;
    let wiring = Wiring::from_config(config);
    let settings = &config.settings;
    let address = &config.address;

    let mut components: Vec<Box<dyn Component>> = vec![
        Box::new(MembershipService::new(
            settings.clone(),
            address.clone(),
            wiring.drain_participants(),
        )),
        Box::new(SplitBrainResolver::new(
            settings.downing.clone(),
            address.clone(),
        )),
    ];

    let extractors: BTreeMap<String, HashExtractor> = config
        .entity_types
        .iter()
        .map(|r| {
            (
                r.type_name.clone(),
                HashExtractor::new(r.settings.number_of_shards),
            )
        })
        .collect();
    components.push(Box::new(Router::new(
        address.clone(),
        settings.router.clone(),
        extractors,
        wiring.singletons.clone(),
    )));

    for registration in &config.entity_types {
        let type_name = &registration.type_name;
        let singleton_name = coordinator_singleton_name(type_name);
        components.push(Box::new(ShardRegion::new(
            type_name.clone(),
            registration.settings.clone(),
            address.clone(),
            &settings.roles,
            registration.factory.clone(),
        )));
        components.push(Box::new(ShardCoordinator::new(
            type_name.clone(),
            singleton_name.clone(),
            registration.settings.clone(),
            address.clone(),
            Box::new(EvenShardAllocation::new(
                registration.settings.rebalance_threshold,
            )),
        )));
        let mut singleton_settings = settings.singleton.clone();
        singleton_settings.role = registration.settings.role.clone();
        components.push(Box::new(SingletonManager::new(
            singleton_name,
            singleton_settings,
            address.clone(),
        )));
    }

    for registration in &config.singletons {
        components.push(Box::new(SingletonManager::new(
            registration.name.clone(),
            settings.singleton.clone(),
            address.clone(),
        )));
        components.push(Box::new(SingletonProxy::new(
            registration.name.clone(),
            settings.singleton.clone(),
        )));
        components.push(Box::new(SingletonHost::new(
            registration.name.clone(),
            registration.factory.clone(),
        )));
    }

    Ok((wiring, components))
}
