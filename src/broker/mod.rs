//! Broker state: session registry, the broker-wide subscription index, and
//! publish dispatch.
//!
//! All broker state lives behind a single mutex with short critical
//! sections; nothing holds it across I/O. Operations needing both a session
//! lock and the broker lock take the session lock first, everywhere.

pub mod retained;
pub mod session;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::LimitsConfig;
use crate::routing::{Topic, Trie};

pub use retained::{MemoryRetained, RetainedStore};
pub use session::{Session, SessionPhase};

/// Broker-assigned session identifier. Strictly increasing, never reused
/// within a broker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey(u64);

impl SessionKey {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct BrokerShared {
    pub(crate) state: Mutex<BrokerState>,
    pub(crate) limits: LimitsConfig,
}

pub(crate) struct BrokerState {
    next_session_key: u64,
    pub(crate) subscriptions: Trie<BTreeSet<SessionKey>>,
    pub(crate) sessions: HashMap<SessionKey, Arc<Session>>,
}

#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_limits(LimitsConfig::default())
    }

    pub fn with_limits(limits: LimitsConfig) -> Self {
        Broker {
            shared: Arc::new(BrokerShared {
                state: Mutex::new(BrokerState {
                    next_session_key: 0,
                    subscriptions: Trie::new(),
                    sessions: HashMap::new(),
                }),
                limits,
            }),
        }
    }

    /// Allocate a fresh session with empty subscriptions and empty queues
    /// and register it.
    pub fn create_session(&self) -> Arc<Session> {
        let mut state = self.shared.state.lock();
        state.next_session_key += 1;
        let key = SessionKey(state.next_session_key);
        let session = Arc::new(Session::new(
            key,
            Arc::downgrade(&self.shared),
            self.shared.limits,
        ));
        state.sessions.insert(key, session.clone());
        tracing::debug!(%key, "session created");
        session
    }

    /// Route `payload` to every session subscribed to a filter matching
    /// `topic`. The broker lock is held only long enough to copy the
    /// recipient set; deliveries then take each session's own lock, so
    /// deliveries to different sessions proceed concurrently.
    pub fn publish(&self, topic: &Topic, payload: Bytes) {
        let recipients: Vec<Arc<Session>> = {
            let state = self.shared.state.lock();
            match state.subscriptions.matches(topic) {
                Some(keys) => keys
                    .iter()
                    .filter_map(|key| state.sessions.get(key).cloned())
                    .collect(),
                None => Vec::new(),
            }
        };
        for session in recipients {
            session.deliver(topic, payload.clone());
        }
    }

    /// Union of session keys subscribed to filters matching `topic`.
    pub fn subscribers(&self, topic: &Topic) -> BTreeSet<SessionKey> {
        self.shared
            .state
            .lock()
            .subscriptions
            .matches(topic)
            .unwrap_or_default()
    }

    /// Whether the broker-wide subscription index holds any filter at all.
    pub fn has_routes(&self) -> bool {
        !self.shared.state.lock().subscriptions.is_empty()
    }

    pub fn session_count(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_are_strictly_increasing_and_unique() {
        let broker = Broker::new();
        let keys: Vec<_> = (0..5).map(|_| broker.create_session().key()).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(keys[0].value(), 1);
        assert_eq!(broker.session_count(), 5);
    }

    #[test]
    fn keys_are_not_reused_after_close() {
        let broker = Broker::new();
        let first = broker.create_session();
        let first_key = first.key();
        first.close();
        let second = broker.create_session();
        assert!(second.key() > first_key);
        assert_eq!(broker.session_count(), 1);
    }
}
