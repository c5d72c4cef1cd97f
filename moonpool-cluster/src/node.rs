//! Tokio runtime driver.
//!
//! [`ClusterNode::start`] spawns one local task per component, each draining
//! its own unbounded queue, plus a ticker task that feeds every component an
//! [`Input::Tick`] each `tick_interval`. Effects are dispatched as soon as a
//! component returns:
//!
//! - sends to this node loop back into the local queues, other sends go to
//!   the [`Transport`];
//! - local events fan out through the [`Wiring`];
//! - cluster events go to [`ClusterNode::subscribe`] receivers;
//! - completions resolve the waiting [`ClusterRouter`] call.
//!
//! Everything is `Rc`-based: the node must run inside a
//! [`tokio::task::LocalSet`].

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::component::{ComponentId, Effect, Input, LocalEvent, Outbox, Target};
use crate::error::{ClusterError, RouteError};
use crate::events::ClusterEvent;
use crate::membership::ClusterState;
use crate::protocol::{ClusterMessage, Envelope, RouteOutcome};
use crate::router::ClusterRouter;
use crate::sharding::ShardTable;
use crate::time::{TimeProvider, TokioTimeProvider};
use crate::transport::Transport;
use crate::wiring::{self, NodeConfig, Wiring};
use crate::UniqueAddress;

const EVENT_CAPACITY: usize = 1024;

/// State shared by the tasks of one node.
pub(crate) struct NodeShared {
    address: UniqueAddress,
    wiring: Wiring,
    transport: Rc<dyn Transport>,
    queues: RefCell<BTreeMap<ComponentId, mpsc::UnboundedSender<Input>>>,
    next_request: Cell<u64>,
    pending: RefCell<HashMap<u64, oneshot::Sender<RouteOutcome>>>,
    events: broadcast::Sender<ClusterEvent>,
    state: watch::Sender<Option<Arc<ClusterState>>>,
    shard_tables: RefCell<BTreeMap<String, Arc<ShardTable>>>,
    singleton_hosts: RefCell<BTreeMap<String, Option<UniqueAddress>>>,
    stop_requested: Cell<bool>,
    shutdown: watch::Sender<bool>,
}

impl NodeShared {
    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn enqueue(&self, target: &ComponentId, input: Input) {
        if let Some(queue) = self.queues.borrow().get(target) {
            let _ = queue.send(input);
        }
    }

    fn broadcast_tick(&self) {
        for queue in self.queues.borrow().values() {
            let _ = queue.send(Input::Tick);
        }
    }

    /// Inbound hook for the transport.
    pub(crate) fn deliver(&self, envelope: Envelope) {
        if self.is_stopped() || &envelope.to != self.address.address() {
            return;
        }
        self.deliver_message(envelope.from, envelope.message);
    }

    fn deliver_message(&self, from: UniqueAddress, message: ClusterMessage) {
        for target in self.wiring.remote_targets(&message) {
            self.enqueue(
                &target,
                Input::Remote {
                    from: from.clone(),
                    message: message.clone(),
                },
            );
        }
    }

    /// Hand a request to the router component. Returns the reply receiver
    /// when a reply is expected.
    pub(crate) fn submit(
        &self,
        target: Target,
        payload: Vec<u8>,
        expects_reply: bool,
    ) -> Result<Option<oneshot::Receiver<RouteOutcome>>, RouteError> {
        if self.is_stopped() {
            return Err(RouteError::Unavailable);
        }
        let request_id = self.next_request.get();
        self.next_request.set(request_id + 1);
        let receiver = if expects_reply {
            let (tx, rx) = oneshot::channel();
            self.pending.borrow_mut().insert(request_id, tx);
            Some(rx)
        } else {
            None
        };
        self.enqueue(
            &ComponentId::Router,
            Input::Local(LocalEvent::Ask {
                request_id,
                target,
                payload,
                expects_reply,
            }),
        );
        Ok(receiver)
    }

    fn observe(&self, event: &LocalEvent) {
        match event {
            LocalEvent::MembershipChanged(state) => {
                self.state.send_replace(Some(state.clone()));
            }
            LocalEvent::ShardTableChanged(table) => {
                let mut tables = self.shard_tables.borrow_mut();
                if table.active {
                    tables.insert(table.type_name.clone(), table.clone());
                } else {
                    tables.remove(&table.type_name);
                }
            }
            LocalEvent::SingletonHostChanged { name, host } => {
                self.singleton_hosts
                    .borrow_mut()
                    .insert(name.clone(), host.clone());
            }
            _ => {}
        }
    }

    fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    if &to == self.address.address() {
                        self.deliver_message(self.address.clone(), message);
                    } else {
                        self.transport.send(Envelope {
                            from: self.address.clone(),
                            to,
                            message,
                        });
                    }
                }
                Effect::Local(event) => {
                    self.observe(&event);
                    for target in self.wiring.local_targets(&event) {
                        self.enqueue(&target, Input::Local(event.clone()));
                    }
                }
                Effect::Event(event) => {
                    if matches!(event, ClusterEvent::SelfDowned | ClusterEvent::SelfRemoved) {
                        // Components still see the final membership change;
                        // the ticker stops the node on its next round.
                        self.stop_requested.set(true);
                    }
                    let _ = self.events.send(event);
                }
                Effect::Complete {
                    request_id,
                    outcome,
                } => {
                    if let Some(tx) = self.pending.borrow_mut().remove(&request_id) {
                        let _ = tx.send(outcome);
                    }
                }
            }
        }
    }

    fn stop(&self) {
        if self.is_stopped() {
            return;
        }
        info!(node = %self.address, "cluster node stopping");
        self.shutdown.send_replace(true);
        self.queues.borrow_mut().clear();
        self.pending.borrow_mut().clear();
        let _ = self.events.send(ClusterEvent::NodeStopped);
    }
}

/// A running cluster node.
///
/// Dropping the handle does not stop the node; call
/// [`shutdown`](Self::shutdown).
pub struct ClusterNode<T: TimeProvider = TokioTimeProvider> {
    shared: Rc<NodeShared>,
    time: T,
    config: NodeConfig,
}

impl<T: TimeProvider + 'static> ClusterNode<T> {
    /// Build the node's components and spawn their tasks.
    ///
    /// Must be called from within a [`tokio::task::LocalSet`].
    pub fn start(
        config: NodeConfig,
        transport: Rc<dyn Transport>,
        time: T,
    ) -> Result<Self, ClusterError> {
        let (wiring, components) = wiring::build(&config)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        let shared = Rc::new(NodeShared {
            address: config.address.clone(),
            wiring,
            transport,
            queues: RefCell::new(BTreeMap::new()),
            next_request: Cell::new(1),
            pending: RefCell::new(HashMap::new()),
            events,
            state,
            shard_tables: RefCell::new(BTreeMap::new()),
            singleton_hosts: RefCell::new(BTreeMap::new()),
            stop_requested: Cell::new(false),
            shutdown,
        });

        for mut component in components {
            let (tx, mut rx) = mpsc::unbounded_channel::<Input>();
            let id = component.id();
            shared.queues.borrow_mut().insert(id.clone(), tx);
            let shared = shared.clone();
            let time = time.clone();
            tokio::task::spawn_local(async move {
                let mut shutdown = shared.shutdown.subscribe();
                let mut out = Outbox::new();
                loop {
                    let input = tokio::select! {
                        input = rx.recv() => input,
                        _ = shutdown.changed() => None,
                    };
                    let Some(input) = input else {
                        break;
                    };
                    component.handle(time.now(), input, &mut out);
                    shared.dispatch(out.drain());
                }
                debug!(component = %id, "component task finished");
            });
        }

        let tick_interval = config.settings.tick_interval;
        {
            let shared = shared.clone();
            let time = time.clone();
            tokio::task::spawn_local(async move {
                let mut shutdown = shared.shutdown.subscribe();
                loop {
                    tokio::select! {
                        _ = time.sleep(tick_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    if shared.stop_requested.get() {
                        shared.stop();
                        break;
                    }
                    shared.broadcast_tick();
                }
            });
        }

        info!(node = %config.address, "cluster node started");
        Ok(Self {
            shared,
            time,
            config,
        })
    }

    pub(crate) fn shared(&self) -> &Rc<NodeShared> {
        &self.shared
    }

    /// This node's address and incarnation.
    pub fn address(&self) -> &UniqueAddress {
        &self.config.address
    }

    /// Inbound hook: hand an envelope received from the network to the node.
    pub fn deliver(&self, envelope: Envelope) {
        self.shared.deliver(envelope);
    }

    /// Handle for sending application requests.
    pub fn router(&self) -> ClusterRouter<T> {
        ClusterRouter::new(
            self.shared.clone(),
            self.time.clone(),
            self.config.settings.router.ask_timeout,
        )
    }

    /// Latest membership snapshot, once the node has published one.
    pub fn cluster_state(&self) -> Option<Arc<ClusterState>> {
        self.shared.state.borrow().clone()
    }

    /// Receiver that is notified of every new membership snapshot.
    pub fn watch_state(&self) -> watch::Receiver<Option<Arc<ClusterState>>> {
        self.shared.state.subscribe()
    }

    /// Shard table of `type_name`, when the active coordinator runs here.
    pub fn shard_table(&self, type_name: &str) -> Option<Arc<ShardTable>> {
        self.shared.shard_tables.borrow().get(type_name).cloned()
    }

    /// Singleton hosts as seen by this node's proxies.
    pub fn singleton_hosts(&self) -> BTreeMap<String, Option<UniqueAddress>> {
        self.shared.singleton_hosts.borrow().clone()
    }

    /// Subscribe to cluster events emitted on this node.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.shared.events.subscribe()
    }

    /// Leave the cluster gracefully. The node stops once it is removed.
    pub fn leave(&self) {
        info!(node = %self.config.address, "leave requested");
        self.shared
            .enqueue(&ComponentId::Membership, Input::Local(LocalEvent::Leave));
    }

    /// Stop every task of this node immediately. Pending requests fail with
    /// [`RouteError::Unavailable`].
    pub fn shutdown(&self) {
        self.shared.stop();
    }

    /// Whether the node has stopped.
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }
}
