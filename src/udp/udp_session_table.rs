use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::udp_conn::UdpConnState;

/// Session id to live virtual connection.
///
/// Lookups on the hot path only take a shard read lock. Creation goes through
/// the entry API so two racing inserts for the same id cannot both win.
#[derive(Default)]
pub struct UdpSessionTable {
    sessions: DashMap<u32, Arc<UdpConnState>>,
    next_generation: AtomicU64,
}

impl UdpSessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(UdpSessionTable::default())
    }

    /// The connection for `session_id`, unless it is missing or already ended.
    pub fn get_active(&self, session_id: u32) -> Option<Arc<UdpConnState>> {
        let state = self.sessions.get(&session_id)?.value().clone();
        state.is_active().then_some(state)
    }

    /// Return the active connection for `session_id`, or build one with `make`
    /// and insert it. `make` receives the generation of the new entry and runs
    /// under the shard write lock, so it must not touch the table.
    ///
    /// The second element is `Some` only when a new connection was inserted.
    pub fn get_or_insert_with<T>(
        &self,
        session_id: u32,
        make: impl FnOnce(u64) -> (Arc<UdpConnState>, T),
    ) -> (Arc<UdpConnState>, Option<T>) {
        match self.sessions.entry(session_id) {
            Entry::Occupied(entry) if entry.get().is_active() => (entry.get().clone(), None),
            Entry::Occupied(mut entry) => {
                let (state, extra) = make(self.next_generation());
                entry.insert(state.clone());
                (state, Some(extra))
            }
            Entry::Vacant(entry) => {
                let (state, extra) = make(self.next_generation());
                entry.insert(state.clone());
                (state, Some(extra))
            }
        }
    }

    /// Remove the entry for `session_id` if it still belongs to `generation`.
    /// A newer connection that replaced it is left alone.
    pub fn remove(&self, session_id: u32, generation: u64) -> bool {
        self.sessions
            .remove_if(&session_id, |_, state| state.generation() == generation)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }
}
