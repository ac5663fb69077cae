//! Registry of live sessions on a listening server.
//!
//! The registry stores non-owning weak references so it never keeps a
//! terminated session alive; entries are pruned opportunistically and on
//! lookup. Its one job is the shutdown broadcast: when the server stops,
//! every session still live gets stopped too.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::session::Session;

/// Identifier assigned to an accepted connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

/// Concurrent weak-reference registry keyed by [`ConnectionId`].
#[derive(Debug, Default)]
pub struct SessionRegistry(DashMap<ConnectionId, Weak<Session>>);

impl SessionRegistry {
    /// Retrieve the session for `id` if it is still alive.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.0.get(&id).and_then(|weak| weak.upgrade())
    }

    /// Register a newly accepted session.
    pub fn insert(&self, id: ConnectionId, session: &Arc<Session>) {
        self.0.insert(id, Arc::downgrade(session));
    }

    /// Remove an entry, typically on connection teardown.
    pub fn remove(&self, id: ConnectionId) { self.0.remove(&id); }

    /// Snapshot of every session still alive.
    #[must_use]
    pub fn live(&self) -> Vec<Arc<Session>> {
        self.0
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// True when no live session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Drop entries whose sessions have terminated.
    pub fn prune(&self) {
        self.0.retain(|_, weak| weak.strong_count() > 0);
    }
}
