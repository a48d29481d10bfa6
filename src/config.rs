//! Tunables for the collection core.

use std::time::Duration;

use crate::error::{GcError, GcResult};

/// Configuration knobs recognized by [`crate::ConcurrentMarkSweep`].
///
/// Every option is validated at construction time. Options that are
/// parsed but not implemented (`aux_gc_threads`, `mutators_cooperate`)
/// fail validation instead of being silently ignored, so a missing
/// feature can never masquerade as a correctness bug later.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Extra dedicated collector threads. Must be 0.
    pub aux_gc_threads: usize,
    /// Native mutator cooperation in marking. Must be false.
    pub mutators_cooperate: bool,
    /// Items per work batch moved between a worker and the shared pool.
    pub batch_capacity: usize,
    /// Batches the bounded shared pool can hold before producers fall
    /// back to their private overflow lists.
    pub batch_pool_capacity: usize,
    /// Private work-list size above which a worker shares half.
    pub share_threshold: usize,
    /// Full steal scans a worker attempts before parking.
    pub steal_attempt_cycles: usize,
    /// Safepoint fingerprints remembered before the set is cleared
    /// wholesale. No LRU eviction.
    pub fingerprint_capacity: usize,
    /// Return addresses hashed into one safepoint fingerprint.
    pub fingerprint_depth: usize,
    /// Allocation volume since the last cycle that triggers scheduling.
    pub allocation_trigger_bytes: usize,
    /// When set, an idle collector schedules a cycle at this interval.
    pub regular_gc_interval: Option<Duration>,
    /// Nudge the scheduler from previously unseen safepoint call sites.
    /// Meant for debug and stress configurations.
    pub aggressive: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            aux_gc_threads: 0,
            mutators_cooperate: false,
            batch_capacity: 256,
            batch_pool_capacity: 512,
            share_threshold: 512,
            steal_attempt_cycles: 4,
            fingerprint_capacity: 8192,
            fingerprint_depth: 8,
            allocation_trigger_bytes: 10 * 1024 * 1024,
            regular_gc_interval: None,
            aggressive: false,
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> GcResult<()> {
        if self.aux_gc_threads != 0 {
            return Err(GcError::UnsupportedConfig(
                "auxiliary GC threads are not yet supported",
            ));
        }
        if self.mutators_cooperate {
            return Err(GcError::UnsupportedConfig(
                "native mutator cooperation in marking is not yet supported",
            ));
        }
        if self.batch_capacity == 0 {
            return Err(GcError::InvalidConfig("batch capacity must be non-zero"));
        }
        if self.batch_pool_capacity == 0 {
            return Err(GcError::InvalidConfig(
                "batch pool capacity must be non-zero",
            ));
        }
        if self.share_threshold < 2 {
            return Err(GcError::InvalidConfig(
                "share threshold must be at least two items",
            ));
        }
        if self.steal_attempt_cycles == 0 {
            return Err(GcError::InvalidConfig(
                "steal attempt cycles must be non-zero",
            ));
        }
        if self.fingerprint_capacity == 0 || self.fingerprint_depth == 0 {
            return Err(GcError::InvalidConfig(
                "fingerprint capacity and depth must be non-zero",
            ));
        }
        Ok(())
    }
}
