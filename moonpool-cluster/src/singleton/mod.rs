//! Cluster singletons.
//!
//! A [`SingletonManager`] on every node decides whether this node hosts the
//! instance; a [`SingletonProxy`] on every node forwards messages to
//! whichever node does. The instance itself is a [`SingletonHost`] wrapping
//! user behavior, or a shard coordinator.

pub mod host;
pub mod manager;
pub mod proxy;

pub use host::{SingletonBehavior, SingletonFactory, SingletonHost};
pub use manager::{ManagerPhase, SingletonManager};
pub use proxy::SingletonProxy;
