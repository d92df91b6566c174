//! Per-connection state tracking for the HTTP server.
//!
//! The table answers one question during shutdown: which connections are
//! idle right now? Idle connections can be interrupted immediately;
//! active ones are left to finish their in-flight request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Lifecycle of one HTTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, no byte of a request read yet.
    New,
    /// A request is being read or handled.
    Active,
    /// Between requests on a keep-alive connection.
    Idle,
    /// Taken over by the application (upgrade). No longer tracked.
    Hijacked,
    /// Fully closed. No longer tracked.
    Closed,
}

struct Entry {
    state: ConnState,
    /// Fired by the shutdown loop to unblock an idle read.
    interrupt: CancellationToken,
}

/// Registry of live HTTP connections.
pub(crate) struct ConnTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl ConnTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a fresh connection in the `New` state and returns its id
    /// together with the interrupt token the shutdown loop will fire.
    pub(crate) fn register(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let interrupt = CancellationToken::new();
        self.lock().insert(
            id,
            Entry {
                state: ConnState::New,
                interrupt: interrupt.clone(),
            },
        );
        (id, interrupt)
    }

    /// Records a state transition. `Closed` and `Hijacked` are terminal and
    /// drop the entry; transitions for unknown ids are ignored.
    pub(crate) fn set_state(&self, id: u64, state: ConnState) {
        let mut entries = self.lock();
        match state {
            ConnState::Closed | ConnState::Hijacked => {
                entries.remove(&id);
            }
            _ => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.state = state;
                }
            }
        }
    }

    /// Interrupt tokens of every connection currently `Idle`.
    ///
    /// `New` connections are left alone: a client mid-way through writing
    /// its first request gets to finish under the read timeout.
    ///
    /// Snapshots under the lock; callers fire the tokens after releasing it.
    pub(crate) fn snapshot_idle(&self) -> Vec<CancellationToken> {
        self.lock()
            .values()
            .filter(|e| matches!(e.state, ConnState::Idle))
            .map(|e| e.interrupt.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
