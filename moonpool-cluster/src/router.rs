//! Request routing.
//!
//! The [`Router`] component turns an application request for a [`Target`]
//! into a delivery to the local shard region or singleton proxy, tracks the
//! requests that wait for a reply and resolves each exactly once: with the
//! reply, with [`RouteOutcome::Timeout`] once the ask timeout expires, or
//! with [`RouteOutcome::Unavailable`] when the target cannot be resolved.
//!
//! The component only notices expired requests on its tick. Callers are
//! held to the exact deadline by their driver: [`ClusterRouter::ask`] wraps
//! the wait in a timer of `ask_timeout`, and the simulation schedules a
//! deadline per request. The first outcome recorded wins.
//!
//! [`ClusterRouter`] is the application-facing handle of a running
//! [`ClusterNode`](crate::ClusterNode).
//!
//! # Example
//!
//! ```rust,ignore
//! let router = node.router();
//! let balance: u64 = router
//!     .ask_typed(Target::entity("account", "alice"), &Deposit { amount: 5 })
//!     .await?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::{JsonCodec, MessageCodec};
use crate::component::{Component, ComponentId, Input, LocalEvent, Outbox, Target};
use crate::config::RouterSettings;
use crate::error::RouteError;
use crate::node::NodeShared;
use crate::protocol::{ClusterMessage, EntityEnvelope, MessageId, RouteOutcome, SingletonEnvelope};
use crate::sharding::{HashExtractor, ShardExtractor};
use crate::time::{TimeProvider, TokioTimeProvider};
use crate::UniqueAddress;

/// Router component of one node.
pub struct Router {
    self_node: UniqueAddress,
    settings: RouterSettings,
    entity_types: BTreeMap<String, HashExtractor>,
    singletons: BTreeSet<String>,
    /// Request id to deadline.
    pending: BTreeMap<u64, Duration>,
}

impl Router {
    /// Create a router that knows the given entity types and singletons.
    pub fn new(
        self_node: UniqueAddress,
        settings: RouterSettings,
        entity_types: BTreeMap<String, HashExtractor>,
        singletons: BTreeSet<String>,
    ) -> Self {
        Self {
            self_node,
            settings,
            entity_types,
            singletons,
            pending: BTreeMap::new(),
        }
    }

    /// Number of requests still waiting for an outcome.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn route(
        &mut self,
        now: Duration,
        request_id: u64,
        target: Target,
        payload: Vec<u8>,
        expects_reply: bool,
        out: &mut Outbox,
    ) {
        let id = MessageId {
            origin: self.self_node.clone(),
            request_id,
        };
        let routed = match target {
            Target::Entity {
                type_name,
                entity_id,
            } => match self.entity_types.get(&type_name) {
                Some(extractor) => {
                    let shard = extractor.shard_id(&entity_id);
                    out.local(LocalEvent::RegionDeliver {
                        type_name,
                        envelope: EntityEnvelope {
                            entity_id,
                            shard,
                            payload,
                            id,
                            expects_reply,
                            hops: 0,
                        },
                    });
                    true
                }
                None => {
                    debug!(type_name = %type_name, request_id, "unknown entity type");
                    false
                }
            },
            Target::Singleton { name } => {
                if self.singletons.contains(&name) {
                    out.local(LocalEvent::ProxyDeliver {
                        name,
                        envelope: SingletonEnvelope {
                            payload,
                            id,
                            expects_reply,
                        },
                    });
                    true
                } else {
                    debug!(singleton = %name, request_id, "unknown singleton");
                    false
                }
            }
        };

        if !expects_reply {
            return;
        }
        if routed {
            self.pending
                .insert(request_id, now + self.settings.ask_timeout);
        } else {
            out.complete(request_id, RouteOutcome::Unavailable);
        }
    }

    fn expire(&mut self, now: Duration, out: &mut Outbox) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            self.pending.remove(&request_id);
            debug!(request_id, "ask timed out");
            out.complete(request_id, RouteOutcome::Timeout);
        }
    }
}

impl Component for Router {
    fn id(&self) -> ComponentId {
        ComponentId::Router
    }

    fn handle(&mut self, now: Duration, input: Input, out: &mut Outbox) {
        match input {
            Input::Local(LocalEvent::Ask {
                request_id,
                target,
                payload,
                expects_reply,
            }) => self.route(now, request_id, target, payload, expects_reply, out),
            Input::Remote {
                message:
                    ClusterMessage::Reply {
                        to,
                        request_id,
                        outcome,
                    },
                ..
            } => {
                if to != self.self_node {
                    debug!(to = %to, request_id, "reply for another incarnation dropped");
                    return;
                }
                if self.pending.remove(&request_id).is_some() {
                    out.complete(request_id, outcome);
                } else {
                    debug!(request_id, "late reply dropped");
                }
            }
            Input::Tick => self.expire(now, out),
            _ => {}
        }
    }
}

/// Application handle for sending requests through a running node.
///
/// Cheap to clone. Requests fail with [`RouteError::Unavailable`] once the
/// node has stopped.
#[derive(Clone)]
pub struct ClusterRouter<T: TimeProvider = TokioTimeProvider, C: MessageCodec = JsonCodec> {
    node: Rc<NodeShared>,
    time: T,
    ask_timeout: Duration,
    codec: C,
}

impl<T: TimeProvider> ClusterRouter<T, JsonCodec> {
    pub(crate) fn new(node: Rc<NodeShared>, time: T, ask_timeout: Duration) -> Self {
        Self {
            node,
            time,
            ask_timeout,
            codec: JsonCodec,
        }
    }
}

impl<T: TimeProvider, C: MessageCodec> ClusterRouter<T, C> {
    /// Use a different codec for the typed helpers.
    pub fn with_codec<C2: MessageCodec>(self, codec: C2) -> ClusterRouter<T, C2> {
        ClusterRouter {
            node: self.node,
            time: self.time,
            ask_timeout: self.ask_timeout,
            codec,
        }
    }

    /// The codec used by the typed helpers.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Send `payload` to `target` and wait for the reply.
    pub async fn ask(&self, target: Target, payload: Vec<u8>) -> Result<Vec<u8>, RouteError> {
        let receiver = self
            .node
            .submit(target, payload, true)?
            .ok_or(RouteError::Unavailable)?;

        // The caller's deadline is exact; the component's tick expiry only
        // clears the pending entry afterwards.
        let outcome = self
            .time
            .timeout(self.ask_timeout, receiver)
            .await
            .map_err(|_| RouteError::Timeout)?
            .map_err(|_| RouteError::Unavailable)?;

        match outcome {
            RouteOutcome::Success(reply) => Ok(reply),
            RouteOutcome::Timeout => Err(RouteError::Timeout),
            RouteOutcome::Unavailable => Err(RouteError::Unavailable),
        }
    }

    /// Send `payload` to `target` without waiting for a reply.
    pub fn tell(&self, target: Target, payload: Vec<u8>) -> Result<(), RouteError> {
        self.node.submit(target, payload, false)?;
        Ok(())
    }

    /// Encode `request`, ask, and decode the reply.
    pub async fn ask_typed<Req, Resp>(&self, target: Target, request: &Req) -> Result<Resp, RouteError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = self.codec.encode(request)?;
        let reply = self.ask(target, payload).await?;
        Ok(self.codec.decode(&reply)?)
    }

    /// Encode `message` and tell.
    pub fn tell_typed<M: Serialize>(&self, target: Target, message: &M) -> Result<(), RouteError> {
        let payload = self.codec.encode(message)?;
        self.tell(target, payload)
    }
}
