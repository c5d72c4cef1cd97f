//! Node addresses.
//!
//! A [`NodeAddress`] is the `host:port` a node is reachable at. It is what
//! seed lists and the transport deal in. A [`UniqueAddress`] adds an
//! incarnation counter so that a node restarted at the same `host:port` is a
//! different member of the cluster than its previous life.
//!
//! Both types are totally ordered. The ordering is the one used by every
//! deterministic tie-break in the crate (leader election, split-brain
//! tie-break, allocation ties): host first, then port, then incarnation.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Errors from parsing a `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    /// The string has no `:` separating host and port.
    #[error("missing port in address: {input}")]
    MissingPort {
        /// The rejected input.
        input: String,
    },

    /// The host part is empty.
    #[error("empty host in address: {input}")]
    EmptyHost {
        /// The rejected input.
        input: String,
    },

    /// The port is not a valid `u16`.
    #[error("invalid port in address: {input}")]
    InvalidPort {
        /// The rejected input.
        input: String,
    },
}

/// A `host:port` pair identifying where a node listens.
///
/// # Examples
///
/// ```
/// use moonpool_cluster::NodeAddress;
///
/// let addr: NodeAddress = "10.0.0.1:2552".parse().expect("valid address");
/// assert_eq!(addr.port(), 2552);
/// assert_eq!(addr.to_string(), "10.0.0.1:2552");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    /// Create an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // rsplit so that bracketed IPv6 hosts keep their inner colons
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort {
                input: s.to_string(),
            })?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost {
                input: s.to_string(),
            });
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort {
                input: s.to_string(),
            })?;
        Ok(Self::new(host, port))
    }
}

/// A node address qualified by its incarnation.
///
/// Every process start gets a fresh incarnation. Membership keys members by
/// `UniqueAddress`, so a restarted node is never merged with the identity it
/// had before the restart.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueAddress {
    address: NodeAddress,
    incarnation: u64,
}

impl UniqueAddress {
    /// Create a unique address from an address and an incarnation.
    pub fn new(address: NodeAddress, incarnation: u64) -> Self {
        Self {
            address,
            incarnation,
        }
    }

    /// Create a unique address whose incarnation is derived from the wall
    /// clock, for production processes that do not track restarts themselves.
    pub fn fresh(address: NodeAddress) -> Self {
        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1);
        Self::new(address, incarnation)
    }

    /// The network address.
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// The incarnation counter.
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Same address, next incarnation.
    pub fn next_incarnation(&self) -> Self {
        Self::new(self.address.clone(), self.incarnation + 1)
    }
}

impl fmt::Display for UniqueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.incarnation)
    }
}
