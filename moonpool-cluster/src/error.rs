//! Crate-level error types.

use crate::codec::CodecError;
use crate::config::ConfigError;

/// Failure of a routed request, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No reply arrived within the ask timeout.
    #[error("request timed out")]
    Timeout,

    /// The target could not be resolved, rejected the message, or the local
    /// node is stopped.
    #[error("target unavailable")]
    Unavailable,

    /// Encoding the request or decoding the reply failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors from building or starting a cluster node.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Invalid settings.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// An entity type was registered twice.
    #[error("entity type '{type_name}' registered twice")]
    DuplicateEntityType {
        /// The duplicated type.
        type_name: String,
    },

    /// A singleton name was registered twice or collides with a shard
    /// coordinator.
    #[error("singleton '{name}' registered twice")]
    DuplicateSingleton {
        /// The duplicated name.
        name: String,
    },

    /// The node has stopped.
    #[error("node stopped")]
    NodeStopped,
}
