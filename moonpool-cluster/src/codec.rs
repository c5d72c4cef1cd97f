//! Payload serialization for routed application messages.
//!
//! Entities and singletons exchange opaque byte payloads. The router's typed
//! helpers ([`ClusterRouter::ask_typed`](crate::ClusterRouter::ask_typed))
//! encode requests and decode replies through a [`MessageCodec`], with
//! [`JsonCodec`] as the default.
//!
//! ```rust
//! use moonpool_cluster::{JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Deposit {
//!     amount: u64,
//! }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Deposit { amount: 5 }).expect("encode");
//! let decoded: Deposit = codec.decode(&bytes).expect("decode");
//! assert_eq!(decoded, Deposit { amount: 5 });
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Converts typed messages to and from payload bytes.
pub trait MessageCodec: Clone {
    /// Encode a message.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode a message.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
