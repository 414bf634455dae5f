//! Per-client session state: subscriptions and per-QoS outbound queues.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Weak;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{BrokerShared, SessionKey};
use crate::config::LimitsConfig;
use crate::protocol::Qos;
use crate::routing::{Filter, RoutePayload, Topic, Trie};

/// Singleton QoS payloads combine by `max`. They are removed whole through
/// `remove`/`adjust`, never through `subtract`, so difference is identity
/// and they are never considered empty.
impl RoutePayload for Qos {
    fn combine(self, other: Self) -> Self {
        self.max(other)
    }

    fn difference(self, _other: &Self) -> Self {
        self
    }

    fn is_empty(&self) -> bool {
        false
    }
}

/// One-way lifecycle: `Open` → `Closing` → `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Open,
    Closing,
    Closed,
}

pub struct Session {
    key: SessionKey,
    broker: Weak<BrokerShared>,
    limits: LimitsConfig,
    state: Mutex<SessionState>,
    outbound: Notify,
}

struct SessionState {
    phase: SessionPhase,
    subscriptions: Trie<Qos>,
    qos0: VecDeque<(Topic, Bytes)>,
    qos1: VecDeque<(Topic, Bytes)>,
    qos2: VecDeque<(Topic, Bytes)>,
    poisoned: bool,
}

impl Session {
    pub(crate) fn new(key: SessionKey, broker: Weak<BrokerShared>, limits: LimitsConfig) -> Self {
        Session {
            key,
            broker,
            limits,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Open,
                subscriptions: Trie::new(),
                qos0: VecDeque::new(),
                qos1: VecDeque::new(),
                qos2: VecDeque::new(),
                poisoned: false,
            }),
            outbound: Notify::new(),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    /// Record the given filter/QoS pairs in both the session trie (combine
    /// = max) and the broker-wide index (combine = union), as one
    /// observable transition: the session lock is taken first, then the
    /// broker lock, and both tries are updated before either is released.
    /// Returns false without touching anything once closing has begun.
    pub fn subscribe(&self, entries: &[(Filter, Qos)]) -> bool {
        let mut local = self.state.lock();
        if local.phase != SessionPhase::Open {
            return false;
        }
        let broker = self.broker.upgrade();
        let mut shared = broker.as_ref().map(|shared| shared.state.lock());
        for (filter, qos) in entries {
            local.subscriptions.insert_with(filter, *qos);
            if let Some(shared) = shared.as_mut() {
                shared
                    .subscriptions
                    .insert_with(filter, BTreeSet::from([self.key]));
            }
        }
        true
    }

    /// Remove each filter from the session trie and this session's key
    /// from the broker index, pruning entries left empty. Same locking
    /// discipline as `subscribe`.
    pub fn unsubscribe(&self, filters: &[Filter]) -> bool {
        let mut local = self.state.lock();
        if local.phase != SessionPhase::Open {
            return false;
        }
        let broker = self.broker.upgrade();
        let mut shared = broker.as_ref().map(|shared| shared.state.lock());
        let key = self.key;
        for filter in filters {
            local.subscriptions.remove(filter);
            if let Some(shared) = shared.as_mut() {
                shared.subscriptions.adjust(filter, |subscribers| {
                    RoutePayload::difference(subscribers, &BTreeSet::from([key]))
                });
            }
        }
        true
    }

    /// Close the session: withdraw every broker-index contribution in one
    /// subtraction, deregister, and drop local state. Idempotent; the
    /// phase moves one way only.
    pub fn close(&self) {
        let mut local = self.state.lock();
        if local.phase != SessionPhase::Open {
            return;
        }
        local.phase = SessionPhase::Closing;
        let key = self.key;
        let contributed = local.subscriptions.map(|_| BTreeSet::from([key]));
        if let Some(broker) = self.broker.upgrade() {
            let mut shared = broker.state.lock();
            shared.subscriptions.subtract(&contributed);
            shared.sessions.remove(&key);
        }
        local.subscriptions = Trie::new();
        local.qos0.clear();
        local.qos1.clear();
        local.qos2.clear();
        local.phase = SessionPhase::Closed;
        drop(local);
        tracing::debug!(%key, "session closed");
        self.outbound.notify_one();
    }

    /// Enqueue a message for this session at the maximum QoS its filters
    /// grant for `topic`; no matching filter means the message is
    /// discarded. A delivery racing `close` is dropped silently. QoS 0
    /// overflow drops the message; QoS 1/2 overflow poisons the session so
    /// its connection tears down.
    pub fn deliver(&self, topic: &Topic, payload: Bytes) {
        let mut state = self.state.lock();
        if state.phase != SessionPhase::Open || state.poisoned {
            return;
        }
        let Some(qos) = state.subscriptions.matches(topic) else {
            return;
        };
        match qos {
            Qos::AtMostOnce => {
                if state.qos0.len() >= self.limits.qos0_queue_depth {
                    tracing::debug!(key = %self.key, %topic, "qos0 queue full, dropping");
                    return;
                }
                state.qos0.push_back((topic.clone(), payload));
            }
            Qos::AtLeastOnce => {
                if state.qos1.len() >= self.limits.qos12_queue_depth {
                    state.poisoned = true;
                    tracing::warn!(key = %self.key, "qos1 queue overflow, poisoning session");
                } else {
                    state.qos1.push_back((topic.clone(), payload));
                }
            }
            Qos::ExactlyOnce => {
                if state.qos2.len() >= self.limits.qos12_queue_depth {
                    state.poisoned = true;
                    tracing::warn!(key = %self.key, "qos2 queue overflow, poisoning session");
                } else {
                    state.qos2.push_back((topic.clone(), payload));
                }
            }
        }
        drop(state);
        self.outbound.notify_one();
    }

    /// Take the next queued message, highest QoS class first. Within each
    /// queue, messages come out in delivery order.
    pub fn pop_outbound(&self) -> Option<(Topic, Bytes, Qos)> {
        let mut state = self.state.lock();
        if let Some((topic, payload)) = state.qos2.pop_front() {
            return Some((topic, payload, Qos::ExactlyOnce));
        }
        if let Some((topic, payload)) = state.qos1.pop_front() {
            return Some((topic, payload, Qos::AtLeastOnce));
        }
        if let Some((topic, payload)) = state.qos0.pop_front() {
            return Some((topic, payload, Qos::AtMostOnce));
        }
        None
    }

    /// Resolves when new outbound work may be available (or the session's
    /// state changed in a way the dispatch loop should observe).
    pub async fn outbound_ready(&self) {
        self.outbound.notified().await;
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    /// Effective QoS this session's filters grant for `topic`.
    pub fn subscription_qos(&self, topic: &Topic) -> Option<Qos> {
        self.state.lock().subscriptions.matches(topic)
    }

    /// Snapshot of one queue, front first.
    pub fn queued(&self, qos: Qos) -> Vec<(Topic, Bytes)> {
        let state = self.state.lock();
        let queue = match qos {
            Qos::AtMostOnce => &state.qos0,
            Qos::AtLeastOnce => &state.qos1,
            Qos::ExactlyOnce => &state.qos2,
        };
        queue.iter().cloned().collect()
    }
}
