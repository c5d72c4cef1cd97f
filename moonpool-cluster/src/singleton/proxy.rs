//! The singleton proxy.
//!
//! Forwards application messages to the node currently hosting the
//! singleton. While the host is unknown the proxy buffers messages (the
//! oldest is dropped when the buffer is full) and periodically asks the
//! oldest member whether it hosts the singleton. Hosts announce themselves,
//! and a message that reaches a node that no longer hosts bounces back here
//! to be buffered again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::component::{Component, ComponentId, Input, LocalEvent, Outbox};
use crate::config::SingletonSettings;
use crate::membership::ClusterState;
use crate::protocol::{ClusterMessage, RouteOutcome, SingletonEnvelope, SingletonMessage};
use crate::UniqueAddress;

/// Singleton proxy component.
pub struct SingletonProxy {
    name: String,
    settings: SingletonSettings,
    state: Option<Arc<ClusterState>>,
    host: Option<(UniqueAddress, u64)>,
    buffer: VecDeque<SingletonEnvelope>,
    last_identify: Option<Duration>,
}

impl SingletonProxy {
    /// Create a proxy for singleton `name`.
    pub fn new(name: impl Into<String>, settings: SingletonSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: None,
            host: None,
            buffer: VecDeque::new(),
            last_identify: None,
        }
    }

    /// Known host.
    pub fn host(&self) -> Option<&UniqueAddress> {
        self.host.as_ref().map(|(node, _)| node)
    }

    /// Buffered message count.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
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

    fn reject(envelope: &SingletonEnvelope, out: &mut Outbox) {
        if envelope.expects_reply {
            out.send(
                &envelope.id.origin,
                ClusterMessage::Reply {
                    to: envelope.id.origin.clone(),
                    request_id: envelope.id.request_id,
                    outcome: RouteOutcome::Unavailable,
                },
            );
        }
    }

    fn set_host(&mut self, host: Option<(UniqueAddress, u64)>, out: &mut Outbox) {
        if self.host == host {
            return;
        }
        match &host {
            Some((node, generation)) => {
                info!(singleton = %self.name, host = %node, generation, "singleton host identified");
            }
            None => debug!(singleton = %self.name, "singleton host unknown"),
        }
        let changed = self.host.as_ref().map(|(n, _)| n) != host.as_ref().map(|(n, _)| n);
        self.host = host;
        if changed {
            out.local(LocalEvent::SingletonHostChanged {
                name: self.name.clone(),
                host: self.host().cloned(),
            });
        }
    }

    fn forward(&mut self, now: Duration, envelope: SingletonEnvelope, out: &mut Outbox) {
        match self.host().cloned() {
            Some(host) => self.send(&host, SingletonMessage::Deliver(envelope), out),
            None => {
                self.enqueue(envelope, false, out);
                self.identify(now, out);
            }
        }
    }

    /// Buffer a message, dropping the oldest when full.
    fn enqueue(&mut self, envelope: SingletonEnvelope, front: bool, out: &mut Outbox) {
        if front {
            self.buffer.push_front(envelope);
        } else {
            self.buffer.push_back(envelope);
        }
        while self.buffer.len() > self.settings.buffer_size {
            if let Some(dropped) = self.buffer.pop_front() {
                warn!(singleton = %self.name, "proxy buffer full, dropping oldest message");
                Self::reject(&dropped, out);
            }
        }
    }

    fn flush(&mut self, out: &mut Outbox) {
        let Some(host) = self.host().cloned() else {
            return;
        };
        if !self.buffer.is_empty() {
            debug!(singleton = %self.name, count = self.buffer.len(), "flushing proxy buffer");
        }
        while let Some(envelope) = self.buffer.pop_front() {
            self.send(&host, SingletonMessage::Deliver(envelope), out);
        }
    }

    fn identify(&mut self, now: Duration, out: &mut Outbox) {
        let due = self.last_identify.map_or(true, |last| {
            now.saturating_sub(last) >= self.settings.identify_interval
        });
        if !due {
            return;
        }
        let oldest = self
            .state
            .as_ref()
            .and_then(|s| s.oldest_with_role(self.settings.role.as_deref()));
        if let Some(oldest) = oldest {
            self.last_identify = Some(now);
            self.send(&oldest, SingletonMessage::Identify, out);
        }
    }

    fn on_message(&mut self, now: Duration, from: UniqueAddress, message: SingletonMessage, out: &mut Outbox) {
        match message {
            SingletonMessage::Announce { generation }
            | SingletonMessage::Identity {
                generation: Some(generation),
            } => {
                let newer = self.host.as_ref().map_or(true, |(_, g)| generation >= *g);
                let alive = self.state.as_ref().map_or(true, |s| s.is_alive(&from));
                if newer && alive {
                    self.set_host(Some((from, generation)), out);
                    self.flush(out);
                }
            }
            SingletonMessage::Bounced(envelope) => {
                if self.host() == Some(&from) {
                    self.set_host(None, out);
                }
                self.enqueue(envelope, true, out);
                self.identify(now, out);
            }
            _ => {}
        }
    }

    fn on_membership(&mut self, state: Arc<ClusterState>, out: &mut Outbox) {
        let lost = self.host().is_some_and(|h| !state.is_alive(h));
        self.state = Some(state);
        if lost {
            self.set_host(None, out);
        }
    }
}

impl Component for SingletonProxy {
    fn id(&self) -> ComponentId {
        ComponentId::SingletonProxy(self.name.clone())
    }

    fn handle(&mut self, now: Duration, input: Input, out: &mut Outbox) {
        match input {
            Input::Local(LocalEvent::ProxyDeliver { envelope, .. }) => self.forward(now, envelope, out),
            Input::Local(LocalEvent::MembershipChanged(state)) => self.on_membership(state, out),
            Input::Remote {
                from,
                message: ClusterMessage::Singleton { message, .. },
            } => self.on_message(now, from, message, out),
            Input::Tick if self.host.is_none() => self.identify(now, out),
            _ => {}
        }
    }
}
