//! Epoch bookkeeping and collection-request coalescing.
//!
//! [`EpochState`] holds the four monotonic epoch counters that describe
//! collection progress (`scheduled >= started >= finished >= finalized`)
//! and wakes whoever waits on them. [`EpochScheduler`] sits in front of
//! it and deduplicates concurrent collection requests so that any number
//! of callers asking for a collection while one is pending all observe
//! the same epoch.

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::types::{Epoch, ScheduleReason};

/// Point-in-time view of the epoch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochSnapshot {
    pub scheduled: Epoch,
    pub started: Epoch,
    pub finished: Epoch,
    pub finalized: Epoch,
}

#[derive(Debug, Default)]
struct StateInner {
    epochs: EpochSnapshot,
    shutdown: bool,
}

/// What the collector thread saw while waiting for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextEpoch {
    Scheduled(Epoch),
    TimedOut,
    Shutdown,
}

/// Progress counters for collection cycles, shared between the collector
/// thread, mutators, and observers.
///
/// All transitions assert the global ordering invariant; violating it is
/// a caller bug and terminates the process.
pub struct EpochState {
    inner: Mutex<StateInner>,
    cond: Condvar,
}

impl Default for EpochState {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner::default()),
            cond: Condvar::new(),
        }
    }

    /// Request a collection. Returns the pending epoch when one is
    /// already outstanding, otherwise schedules and returns a fresh one.
    pub fn schedule(&self) -> Epoch {
        let mut guard = self.inner.lock();
        if guard.epochs.scheduled > guard.epochs.finished {
            return guard.epochs.scheduled;
        }
        guard.epochs.scheduled += 1;
        self.cond.notify_all();
        guard.epochs.scheduled
    }

    /// Record that the collector began running `epoch`.
    pub fn start(&self, epoch: Epoch) {
        let mut guard = self.inner.lock();
        assert!(
            epoch > guard.epochs.started && epoch <= guard.epochs.scheduled,
            "starting epoch {} out of order (started {}, scheduled {})",
            epoch,
            guard.epochs.started,
            guard.epochs.scheduled,
        );
        guard.epochs.started = epoch;
    }

    /// Record that `epoch` completed its cycle and wake its waiters.
    pub fn finish(&self, epoch: Epoch) {
        let mut guard = self.inner.lock();
        assert!(
            epoch == guard.epochs.started && epoch > guard.epochs.finished,
            "finishing epoch {} out of order (started {}, finished {})",
            epoch,
            guard.epochs.started,
            guard.epochs.finished,
        );
        guard.epochs.finished = epoch;
        self.cond.notify_all();
    }

    /// Record that every finalizer for `epoch` has run.
    pub fn finalized(&self, epoch: Epoch) {
        let mut guard = self.inner.lock();
        assert!(
            epoch <= guard.epochs.finished && epoch > guard.epochs.finalized,
            "finalizing epoch {} out of order (finished {}, finalized {})",
            epoch,
            guard.epochs.finished,
            guard.epochs.finalized,
        );
        guard.epochs.finalized = epoch;
        self.cond.notify_all();
    }

    /// Block until `epoch` has finished, or shutdown was requested.
    pub fn wait_epoch_finished(&self, epoch: Epoch) {
        let mut guard = self.inner.lock();
        while guard.epochs.finished < epoch && !guard.shutdown {
            self.cond.wait(&mut guard);
        }
    }

    /// Block until `epoch` has been finalized, or shutdown was requested.
    pub fn wait_epoch_finalized(&self, epoch: Epoch) {
        let mut guard = self.inner.lock();
        while guard.epochs.finalized < epoch && !guard.shutdown {
            self.cond.wait(&mut guard);
        }
    }

    /// Collector-side: block until an epoch is scheduled that has not
    /// started yet.
    pub fn wait_next_epoch(&self) -> NextEpoch {
        let mut guard = self.inner.lock();
        loop {
            if guard.shutdown {
                return NextEpoch::Shutdown;
            }
            if guard.epochs.scheduled > guard.epochs.started {
                return NextEpoch::Scheduled(guard.epochs.scheduled);
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Like [`EpochState::wait_next_epoch`] but gives up after `timeout`,
    /// letting the collector run interval-triggered cycles.
    pub fn wait_next_epoch_for(&self, timeout: std::time::Duration) -> NextEpoch {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.lock();
        loop {
            if guard.shutdown {
                return NextEpoch::Shutdown;
            }
            if guard.epochs.scheduled > guard.epochs.started {
                return NextEpoch::Scheduled(guard.epochs.scheduled);
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                if guard.shutdown {
                    return NextEpoch::Shutdown;
                }
                if guard.epochs.scheduled > guard.epochs.started {
                    return NextEpoch::Scheduled(guard.epochs.scheduled);
                }
                return NextEpoch::TimedOut;
            }
        }
    }

    /// Wake everyone for a clean exit. Waiters return without their
    /// condition holding; the collector finishes its current cycle first.
    pub fn request_shutdown(&self) {
        let mut guard = self.inner.lock();
        guard.shutdown = true;
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn snapshot(&self) -> EpochSnapshot {
        self.inner.lock().epochs
    }
}

/// The injected scheduling function; owns the actual epoch arithmetic.
pub type ScheduleGc = Box<dyn Fn(ScheduleReason) -> Epoch + Send + Sync>;

#[derive(Debug, Default)]
struct SchedulerInner {
    scheduled: Epoch,
    finished: Epoch,
    in_progress: bool,
}

/// Deduplicates collection requests into monotonically increasing epochs.
///
/// The injected `schedule_gc` callback owns the actual epoch arithmetic
/// (it is expected to be the coordinator's "start or observe a cycle"
/// entry point) and must not re-enter the scheduler. All operations take
/// one short-lived mutex; nothing blocks inside it.
pub struct EpochScheduler {
    inner: Mutex<SchedulerInner>,
    schedule_gc: ScheduleGc,
}

impl EpochScheduler {
    pub fn new(schedule_gc: ScheduleGc) -> Self {
        Self {
            inner: Mutex::new(SchedulerInner::default()),
            schedule_gc,
        }
    }

    /// Request a collection, always consulting the underlying scheduling
    /// function. Epochs never regress.
    pub fn schedule_next_epoch(&self, reason: ScheduleReason) -> Epoch {
        let mut guard = self.inner.lock();
        self.schedule_locked(&mut guard, reason)
    }

    /// Cheap variant for frequent call sites: once a collection is
    /// outstanding, returns its epoch without invoking the underlying
    /// scheduling function.
    pub fn schedule_next_epoch_if_not_in_progress(&self, reason: ScheduleReason) -> Epoch {
        let mut guard = self.inner.lock();
        if guard.in_progress {
            return guard.scheduled;
        }
        self.schedule_locked(&mut guard, reason)
    }

    fn schedule_locked(
        &self,
        guard: &mut parking_lot::MutexGuard<'_, SchedulerInner>,
        reason: ScheduleReason,
    ) -> Epoch {
        let epoch = (self.schedule_gc)(reason);
        assert!(
            epoch >= guard.scheduled,
            "collection epochs must not regress ({} after {})",
            epoch,
            guard.scheduled,
        );
        trace!("epoch {} scheduled: {}", epoch, reason);
        guard.scheduled = epoch;
        guard.in_progress = true;
        epoch
    }

    /// Must be called exactly once per epoch, by the thread that
    /// completed it. The "in progress" marker stays set when a newer
    /// epoch was scheduled while this one was finishing.
    pub fn on_gc_finish(&self, epoch: Epoch) {
        let mut guard = self.inner.lock();
        assert!(
            epoch <= guard.scheduled,
            "finishing epoch {} that was never scheduled (latest {})",
            epoch,
            guard.scheduled,
        );
        assert!(
            epoch > guard.finished,
            "finishing epoch {} out of order (already finished {})",
            epoch,
            guard.finished,
        );
        guard.finished = epoch;
        if epoch == guard.scheduled {
            guard.in_progress = false;
        }
    }

    pub fn scheduled_epoch(&self) -> Epoch {
        self.inner.lock().scheduled
    }

    pub fn is_in_progress(&self) -> bool {
        self.inner.lock().in_progress
    }
}
