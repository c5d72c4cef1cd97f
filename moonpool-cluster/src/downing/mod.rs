//! Split-brain resolution.
//!
//! [`strategy`] holds the pure decision rules, [`resolver`] the component
//! that applies them once the unreachable set is stable.

pub mod resolver;
pub mod strategy;

pub use resolver::{ResolverPhase, SplitBrainResolver};
pub use strategy::{decide, Decision, PartitionView};
