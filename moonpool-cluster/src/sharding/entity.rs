//! User entity behavior.
//!
//! An [`Entity`] is created lazily by its region the first time a message for
//! its id arrives, and lives until it is passivated (idle timeout, its own
//! request, or a shard handoff). Messages for one entity are processed one
//! at a time in arrival order.

use std::rc::Rc;

/// Behavior of one sharded entity instance.
pub trait Entity {
    /// Process one message and return the reply payload. The reply is only
    /// delivered when the sender asked for one.
    fn receive(&mut self, ctx: &mut EntityContext, payload: &[u8]) -> Vec<u8>;
}

/// Creates the entity instance for an id.
pub type EntityFactory = Rc<dyn Fn(&str) -> Box<dyn Entity>>;

/// Per-message context handed to [`Entity::receive`].
#[derive(Debug)]
pub struct EntityContext {
    entity_id: String,
    passivate: bool,
}

impl EntityContext {
    pub(crate) fn new(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            passivate: false,
        }
    }

    /// Id of the entity processing the message.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Stop this entity after the current message. Its state is discarded;
    /// the next message for the id creates a fresh instance.
    pub fn passivate(&mut self) {
        self.passivate = true;
    }

    pub(crate) fn passivate_requested(&self) -> bool {
        self.passivate
    }
}
