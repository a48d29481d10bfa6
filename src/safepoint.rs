//! Safepoint fingerprint deduplication.
//!
//! In aggressive configurations the scheduler wants to trigger a
//! collection whenever the program reaches a safepoint it has not been
//! seen at before, without triggering again every time a hot loop spins
//! past the same site. [`SafePointTracker`] remembers a bounded set of
//! call-stack fingerprints; when the set overflows it is cleared
//! wholesale rather than evicted entry by entry. Used only for
//! scheduling nudges, never for correctness.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use dashmap::DashSet;

/// Stack frames belonging to the tracker itself, skipped before hashing.
const SKIP_FRAMES: usize = 2;

pub struct SafePointTracker {
    seen: DashSet<u64>,
    capacity: usize,
    depth: usize,
}

impl SafePointTracker {
    pub fn new(capacity: usize, depth: usize) -> Self {
        assert!(capacity > 0, "fingerprint capacity must be non-zero");
        assert!(depth > 0, "fingerprint depth must be non-zero");
        Self {
            seen: DashSet::new(),
            capacity,
            depth,
        }
    }

    /// Returns true the first time the current call stack's fingerprint
    /// is seen since the set was last cleared.
    pub fn register_current_safe_point(&self) -> bool {
        let fingerprint = self.fingerprint();
        if self.seen.len() >= self.capacity {
            self.seen.clear();
        }
        self.seen.insert(fingerprint)
    }

    /// Hash of the top `depth` return addresses of the calling thread.
    fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        let mut skipped = 0;
        let mut captured = 0;
        backtrace::trace(|frame| {
            if skipped < SKIP_FRAMES {
                skipped += 1;
                return true;
            }
            hasher.write_usize(frame.ip() as usize);
            captured += 1;
            captured < self.depth
        });
        hasher.finish()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
