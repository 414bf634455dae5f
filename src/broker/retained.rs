//! Retained message store interface and the in-memory implementation.
//!
//! The broker consumes this as a collaborator: PUBLISH packets with the
//! retain flag call `store` (or `clear`, for an empty payload), and new
//! subscriptions replay `matching` results through the normal delivery
//! path.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::routing::{Filter, Topic};

pub trait RetainedStore: Send + Sync {
    fn store(&self, topic: &Topic, payload: Bytes);
    fn clear(&self, topic: &Topic);
    /// All retained messages whose topic matches `filter`.
    fn matching(&self, filter: &Filter) -> Vec<(Topic, Bytes)>;
}

/// Retained store with deterministic ordering.
#[derive(Default)]
pub struct MemoryRetained {
    messages: Mutex<BTreeMap<String, (Topic, Bytes)>>,
}

impl MemoryRetained {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RetainedStore for MemoryRetained {
    fn store(&self, topic: &Topic, payload: Bytes) {
        self.messages
            .lock()
            .insert(topic.to_string(), (topic.clone(), payload));
    }

    fn clear(&self, topic: &Topic) {
        self.messages.lock().remove(&topic.to_string());
    }

    fn matching(&self, filter: &Filter) -> Vec<(Topic, Bytes)> {
        self.messages
            .lock()
            .values()
            .filter(|(topic, _)| filter.matches(topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect()
    }
}
