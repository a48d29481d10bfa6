//! Mutator backpressure.
//!
//! While a collection is pending, allocation-heavy mutator threads are
//! parked at their next cooperative checkpoint until the epoch they are
//! waiting for completes. The hot safepoint path is a handful of atomic
//! loads; only a thread that must actually wait touches the lock and
//! condition variable.
//!
//! Each mutator publishes its progress in one `AtomicU64`: a value of
//! `2 * e` means "parked waiting for epoch e", `2 * e + 1` means "passed
//! epoch e". Any thread can therefore answer "has that mutator passed
//! epoch E" with a single load and no locking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::types::Epoch;

/// Per-mutator assist progress, readable from any thread.
#[derive(Debug, Default)]
pub struct AssistState {
    started_waiting: AtomicU64,
}

impl AssistState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the owning mutator has waited out epoch `epoch` (or was
    /// never parked on it in the first place and moved past a later one).
    pub fn passed_epoch(&self, epoch: Epoch) -> bool {
        self.started_waiting.load(Ordering::Acquire) > epoch * 2
    }

    /// The epoch the owning mutator is currently parked on, if any.
    pub fn parked_at(&self) -> Option<Epoch> {
        let value = self.started_waiting.load(Ordering::Acquire);
        if value != 0 && value % 2 == 0 {
            Some(value / 2)
        } else {
            None
        }
    }
}

/// Throttles mutators while a collection runs.
pub struct MutatorAssists {
    /// Highest epoch for which assists are currently demanded.
    assists_epoch: AtomicU64,
    /// Highest epoch known to be completed.
    completed_epoch: AtomicU64,
    /// The global "safepoints must check in" switch.
    active: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Default for MutatorAssists {
    fn default() -> Self {
        Self::new()
    }
}

impl MutatorAssists {
    pub fn new() -> Self {
        Self {
            assists_epoch: AtomicU64::new(0),
            completed_epoch: AtomicU64::new(0),
            active: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Demand that mutators park for `epoch`. No-op when assists for
    /// `epoch` or later are already active or already completed.
    pub fn request_assists(&self, epoch: Epoch) {
        let _guard = self.mutex.lock();
        if self.completed_epoch.load(Ordering::Acquire) >= epoch {
            return;
        }
        let previous = self.assists_epoch.fetch_max(epoch, Ordering::AcqRel);
        if previous < epoch {
            trace!("assists requested for epoch {}", epoch);
        }
        self.active.store(true, Ordering::Release);
    }

    /// Mutator-side cooperative checkpoint. Returns immediately unless
    /// assists are demanded for an epoch that has not completed yet.
    #[inline]
    pub fn safepoint(&self, state: &AssistState) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let epoch = self.assists_epoch.load(Ordering::Acquire);
        if self.completed_epoch.load(Ordering::Acquire) >= epoch {
            return;
        }
        self.wait_for_epoch(epoch, state);
    }

    #[cold]
    fn wait_for_epoch(&self, epoch: Epoch, state: &AssistState) {
        state.started_waiting.store(epoch * 2, Ordering::Release);
        {
            let mut guard = self.mutex.lock();
            while self.completed_epoch.load(Ordering::Acquire) < epoch {
                self.cond.wait(&mut guard);
            }
        }
        state.started_waiting.store(epoch * 2 + 1, Ordering::Release);
    }

    /// Collector-side: `epoch` is fully done. Epochs must be completed in
    /// strictly increasing order. Wakes every parked mutator and drops
    /// the global switch when no newer epoch is pending.
    pub fn mark_epoch_completed(&self, epoch: Epoch) {
        let _guard = self.mutex.lock();
        let previous = self.completed_epoch.load(Ordering::Relaxed);
        assert!(
            epoch > previous,
            "epochs must be completed in increasing order ({} after {})",
            epoch,
            previous,
        );
        self.completed_epoch.store(epoch, Ordering::Release);
        if self.assists_epoch.load(Ordering::Acquire) <= epoch {
            self.active.store(false, Ordering::Release);
        }
        trace!("epoch {} completed, releasing parked mutators", epoch);
        self.cond.notify_all();
    }

    pub fn completed_epoch(&self) -> Epoch {
        self.completed_epoch.load(Ordering::Acquire)
    }

    pub fn assists_requested(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}
