//! Mutator thread registration and per-thread collection state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::assists::AssistState;

#[derive(Debug, Default)]
struct MutatorInner {
    id: usize,
    assist: AssistState,
    allocated_bytes: AtomicUsize,
}

/// Handle to one registered mutator thread.
///
/// Clones share the same underlying state, so the runtime can keep one
/// handle thread-local while the registry keeps another.
#[derive(Clone)]
pub struct MutatorThread {
    inner: Arc<MutatorInner>,
}

impl MutatorThread {
    pub fn new(id: usize) -> Self {
        Self {
            inner: Arc::new(MutatorInner {
                id,
                assist: AssistState::new(),
                allocated_bytes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Backpressure progress for this mutator, readable from any thread.
    pub fn assist(&self) -> &AssistState {
        &self.inner.assist
    }

    /// Account `bytes` of fresh allocation. Returns the running total for
    /// this thread since its counter was last reset.
    pub fn note_allocation(&self, bytes: usize) -> usize {
        self.inner.allocated_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn reset_allocated(&self) {
        self.inner.allocated_bytes.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id())
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

/// All currently registered mutator threads, keyed by id.
pub struct ThreadRegistry {
    threads: DashMap<usize, MutatorThread>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: DashMap::new(),
        }
    }

    /// Register `thread`. Registering the same id twice is a caller bug.
    pub fn register(&self, thread: MutatorThread) {
        let id = thread.id();
        let previous = self.threads.insert(id, thread);
        assert!(previous.is_none(), "mutator {} registered twice", id);
    }

    pub fn unregister(&self, id: usize) -> Option<MutatorThread> {
        self.threads.remove(&id).map(|(_, thread)| thread)
    }

    pub fn get(&self, id: usize) -> Option<MutatorThread> {
        self.threads.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Snapshot of the registered threads. Taken under the world pause
    /// during root collection, so the set cannot change mid-iteration
    /// there; elsewhere it is advisory.
    pub fn iter(&self) -> Vec<MutatorThread> {
        self.threads
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
