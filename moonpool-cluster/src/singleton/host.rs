//! Host for user-defined singletons.

use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::component::{Component, ComponentId, Input, LocalEvent, Outbox};
use crate::protocol::{ClusterMessage, RouteOutcome, SingletonEnvelope};

/// Behavior of a user singleton.
pub trait SingletonBehavior {
    /// Process one message and return the reply payload.
    fn receive(&mut self, payload: &[u8]) -> Vec<u8>;
}

/// Creates a fresh singleton instance. State is not carried across
/// generations.
pub type SingletonFactory = Rc<dyn Fn() -> Box<dyn SingletonBehavior>>;

/// Runs the user singleton while the manager says so.
pub struct SingletonHost {
    name: String,
    factory: SingletonFactory,
    instance: Option<(u64, Box<dyn SingletonBehavior>)>,
}

impl SingletonHost {
    /// Create a host for singleton `name`.
    pub fn new(name: impl Into<String>, factory: SingletonFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            instance: None,
        }
    }

    /// Generation currently running.
    pub fn generation(&self) -> Option<u64> {
        self.instance.as_ref().map(|(g, _)| *g)
    }

    fn reply(envelope: &SingletonEnvelope, outcome: RouteOutcome, out: &mut Outbox) {
        if envelope.expects_reply {
            out.send(
                &envelope.id.origin,
                ClusterMessage::Reply {
                    to: envelope.id.origin.clone(),
                    request_id: envelope.id.request_id,
                    outcome,
                },
            );
        }
    }
}

impl Component for SingletonHost {
    fn id(&self) -> ComponentId {
        ComponentId::SingletonHost(self.name.clone())
    }

    fn handle(&mut self, _now: Duration, input: Input, out: &mut Outbox) {
        match input {
            Input::Local(LocalEvent::InstanceStart { generation, .. }) => {
                debug!(singleton = %self.name, generation, "creating singleton instance");
                self.instance = Some((generation, (self.factory)()));
            }
            Input::Local(LocalEvent::InstanceStop { .. }) => {
                self.instance = None;
                out.local(LocalEvent::InstanceStopped {
                    name: self.name.clone(),
                });
            }
            Input::Local(LocalEvent::InstanceDeliver { envelope, .. }) => match &mut self.instance {
                Some((_, behavior)) => {
                    let reply = behavior.receive(&envelope.payload);
                    Self::reply(&envelope, RouteOutcome::Success(reply), out);
                }
                None => Self::reply(&envelope, RouteOutcome::Unavailable, out),
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Effect;
    use crate::protocol::MessageId;
    use crate::{NodeAddress, UniqueAddress};

    struct Echo;

    impl SingletonBehavior for Echo {
        fn receive(&mut self, payload: &[u8]) -> Vec<u8> {
            payload.to_vec()
        }
    }

    #[test]
    fn test_host_lifecycle() {
        let mut host = SingletonHost::new("echo", Rc::new(|| Box::new(Echo) as Box<dyn SingletonBehavior>));
        let mut out = Outbox::new();
        let envelope = SingletonEnvelope {
            payload: b"hi".to_vec(),
            id: MessageId {
                origin: UniqueAddress::new(NodeAddress::new("127.0.0.1", 1), 1),
                request_id: 1,
            },
            expects_reply: true,
        };

        host.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::InstanceDeliver {
                name: "echo".into(),
                envelope: envelope.clone(),
            }),
            &mut out,
        );
        host.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::InstanceStart {
                name: "echo".into(),
                generation: 1,
            }),
            &mut out,
        );
        assert_eq!(host.generation(), Some(1));
        host.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::InstanceDeliver {
                name: "echo".into(),
                envelope,
            }),
            &mut out,
        );
        host.handle(
            Duration::ZERO,
            Input::Local(LocalEvent::InstanceStop { name: "echo".into() }),
            &mut out,
        );
        assert_eq!(host.generation(), None);

        let outcomes: Vec<RouteOutcome> = out
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Send {
                    message: ClusterMessage::Reply { outcome, .. },
                    ..
                } => Some(outcome),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![RouteOutcome::Unavailable, RouteOutcome::Success(b"hi".to_vec())]
        );
    }
}
