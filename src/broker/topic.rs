//! Topic management
//!
//! A `Topic` holds the set of connection ids subscribed to one topic name.
//! Duplicate subscriptions are a no-op.
//!
//! Concurrency note: topics live inside the broker's `DashMap`; callers mutate
//! them only through the map's entry guards so that "remove, then drop the
//! topic if empty" happens atomically per topic.

use std::collections::HashSet;

pub type ConnectionId = String;

#[derive(Debug, Default, Clone)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashSet<ConnectionId>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Add a subscriber to the topic. Duplicate adds are ignored.
    pub fn subscribe(&mut self, id: ConnectionId) {
        self.subscribers.insert(id);
    }

    /// Remove a subscriber from the topic.
    pub fn unsubscribe(&mut self, id: &str) {
        self.subscribers.remove(id);
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
