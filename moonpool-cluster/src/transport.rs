//! Transport seam between nodes.
//!
//! The cluster core does not open sockets. A running [`ClusterNode`] hands
//! every outbound [`Envelope`] to a [`Transport`], and the host calls
//! [`ClusterNode::deliver`] for every inbound one. [`InMemoryNetwork`] wires
//! nodes of one process together, with partitions and random drops for
//! tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::node::{ClusterNode, NodeShared};
use crate::protocol::Envelope;
use crate::time::TimeProvider;
use crate::NodeAddress;

/// Outbound side of a node's network connection.
///
/// Delivery is best effort: implementations may drop, but must not reorder
/// envelopes between one pair of nodes.
pub trait Transport {
    /// Send an envelope to `envelope.to`.
    fn send(&self, envelope: Envelope);
}

struct NetworkInner {
    nodes: BTreeMap<NodeAddress, Weak<NodeShared>>,
    blocked: BTreeSet<(NodeAddress, NodeAddress)>,
    drop_rate: f64,
    rng: ChaCha8Rng,
}

/// In-process network connecting [`ClusterNode`]s on one thread.
#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Rc<RefCell<NetworkInner>>,
}

impl InMemoryNetwork {
    /// Create a network; `seed` drives the drop decisions.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(NetworkInner {
                nodes: BTreeMap::new(),
                blocked: BTreeSet::new(),
                drop_rate: 0.0,
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    /// Handle to pass to [`ClusterNode::start`].
    pub fn transport(&self) -> Rc<dyn Transport> {
        Rc::new(self.clone())
    }

    /// Route envelopes addressed to `node`'s address to it.
    pub fn attach<T: TimeProvider + 'static>(&self, node: &ClusterNode<T>) {
        self.inner.borrow_mut().nodes.insert(
            node.address().address().clone(),
            Rc::downgrade(node.shared()),
        );
    }

    /// Stop routing to `address`.
    pub fn detach(&self, address: &NodeAddress) {
        self.inner.borrow_mut().nodes.remove(address);
    }

    /// Block traffic in both directions between every node of `a` and every
    /// node of `b`.
    pub fn partition(&self, a: &[NodeAddress], b: &[NodeAddress]) {
        let mut inner = self.inner.borrow_mut();
        for x in a {
            for y in b {
                inner.blocked.insert((x.clone(), y.clone()));
                inner.blocked.insert((y.clone(), x.clone()));
            }
        }
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.inner.borrow_mut().blocked.clear();
    }

    /// Probability in `[0, 1]` that an envelope is silently dropped.
    pub fn set_drop_rate(&self, rate: f64) {
        self.inner.borrow_mut().drop_rate = rate.clamp(0.0, 1.0);
    }
}

impl Transport for InMemoryNetwork {
    fn send(&self, envelope: Envelope) {
        let target = {
            let mut inner = self.inner.borrow_mut();
            let from = envelope.from.address().clone();
            if inner.blocked.contains(&(from, envelope.to.clone())) {
                trace!(to = %envelope.to, "dropped by partition");
                return;
            }
            let drop_rate = inner.drop_rate;
            if drop_rate > 0.0 && inner.rng.gen_bool(drop_rate) {
                trace!(to = %envelope.to, "dropped at random");
                return;
            }
            inner.nodes.get(&envelope.to).and_then(Weak::upgrade)
        };
        if let Some(node) = target {
            node.deliver(envelope);
        }
    }
}
