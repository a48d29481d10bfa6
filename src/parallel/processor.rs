//! Work distribution across collector and assist threads, with symmetric
//! termination detection.
//!
//! Every worker loops: pop from its private list, refill from its
//! overflow batches, steal from the shared store for a bounded number of
//! scan cycles, then park. The last worker to park while the store is
//! empty declares the round done exactly once and broadcasts the wakeup;
//! every other waking worker re-checks the flag before resuming its
//! search, so a sleeper can never resume against a finished round.
//!
//! The processor is generic over a [`SharedStore`] strategy; the private
//! side of every worker is identical across strategies.
//!
//! Contract violations here (registering past the expected worker count,
//! registering after termination, resetting an unfinished round,
//! dropping a worker that still holds work) are unconditional assertions:
//! they are caller bugs, not runtime conditions, and the process must not
//! continue past them.

use std::collections::VecDeque;
use std::marker::PhantomData;

use crossbeam_utils::Backoff;
use log::trace;
use parking_lot::{Condvar, Mutex};

use super::batch::Batch;
use super::worklist::SharedStore;

#[derive(Debug, Default)]
struct TerminationSync {
    registered: usize,
    waiting: usize,
    exited: usize,
    all_done: bool,
}

enum WaitOutcome {
    NewWork,
    AllDone,
}

/// Many-producer, many-consumer distributor for one round of work.
///
/// `expected_workers` is exact: termination can only be declared once
/// every expected worker has registered, and registering more than that
/// is fatal.
pub struct ParallelProcessor<T, S: SharedStore<T>> {
    store: S,
    expected_workers: usize,
    batch_capacity: usize,
    share_threshold: usize,
    steal_attempt_cycles: usize,
    sync: Mutex<TerminationSync>,
    cond: Condvar,
    _items: PhantomData<fn(T) -> T>,
}

impl<T: Send, S: SharedStore<T>> ParallelProcessor<T, S> {
    pub fn new(
        store: S,
        expected_workers: usize,
        batch_capacity: usize,
        share_threshold: usize,
        steal_attempt_cycles: usize,
    ) -> Self {
        assert!(expected_workers > 0, "processor needs at least one worker");
        assert!(batch_capacity > 0, "batch capacity must be non-zero");
        assert!(share_threshold >= 2, "share threshold must allow a split");
        assert!(steal_attempt_cycles > 0, "steal cycles must be non-zero");
        Self {
            store,
            expected_workers,
            batch_capacity,
            share_threshold,
            steal_attempt_cycles,
            sync: Mutex::new(TerminationSync::default()),
            cond: Condvar::new(),
            _items: PhantomData,
        }
    }

    /// Join the round as a worker. Fatal after termination was detected
    /// or when `expected_workers` workers have already registered.
    pub fn register_worker(&self) -> Worker<'_, T, S> {
        let mut guard = self.sync.lock();
        assert!(
            !guard.all_done,
            "worker registration after termination was detected"
        );
        assert!(
            guard.registered < self.expected_workers,
            "more than {} workers registered",
            self.expected_workers,
        );
        guard.registered += 1;
        let index = guard.registered - 1;
        drop(guard);
        Worker {
            processor: self,
            index,
            local: VecDeque::new(),
            overflow: VecDeque::new(),
        }
    }

    pub fn expected_workers(&self) -> usize {
        self.expected_workers
    }

    pub fn registered_workers(&self) -> usize {
        self.sync.lock().registered
    }

    pub fn is_all_done(&self) -> bool {
        self.sync.lock().all_done
    }

    /// Block until every registered worker has actually left its work
    /// loop. Distinct from `all_done`, which only means no work was
    /// observed; workers may still be unwinding.
    pub fn wait_every_worker_termination(&self) {
        let mut guard = self.sync.lock();
        assert!(
            guard.all_done,
            "termination barrier used before the round completed"
        );
        while guard.exited < guard.registered {
            self.cond.wait(&mut guard);
        }
    }

    /// Arm the processor for another round. Requires the previous round
    /// to have terminated and every worker to have left its loop; the
    /// worker registry is kept.
    pub fn reset_for_new_work(&self) {
        let mut guard = self.sync.lock();
        assert!(
            guard.all_done,
            "resetting a processor whose round has not terminated"
        );
        assert!(
            guard.waiting == 0 && guard.exited == guard.registered,
            "resetting while workers are still unwinding"
        );
        assert!(self.store.is_empty(), "resetting with shared work left");
        guard.all_done = false;
        guard.exited = 0;
    }

    /// Pairs the notification with a parked worker's re-check under the
    /// same lock.
    fn notify_new_work(&self) {
        let _guard = self.sync.lock();
        self.cond.notify_all();
    }

    fn wait_for_work(&self) -> WaitOutcome {
        let mut guard = self.sync.lock();
        if guard.all_done {
            return WaitOutcome::AllDone;
        }
        if guard.registered == self.expected_workers && guard.waiting + 1 == guard.registered {
            if self.store.is_empty() {
                // Everyone else is asleep and there is no work anywhere:
                // this worker is the one that declares the round over.
                guard.all_done = true;
                trace!("work round terminated");
                self.cond.notify_all();
                return WaitOutcome::AllDone;
            }
            // Shared work is still visible; go take it instead of
            // parking the last awake worker.
            return WaitOutcome::NewWork;
        }
        guard.waiting += 1;
        self.cond.wait(&mut guard);
        guard.waiting -= 1;
        if guard.all_done {
            WaitOutcome::AllDone
        } else {
            WaitOutcome::NewWork
        }
    }

    fn note_worker_exit(&self) {
        let mut guard = self.sync.lock();
        guard.exited += 1;
        self.cond.notify_all();
    }
}

impl<T, S: SharedStore<T>> Drop for ParallelProcessor<T, S> {
    fn drop(&mut self) {
        let sync = self.sync.get_mut();
        assert!(
            sync.waiting == 0,
            "processor dropped with {} parked workers",
            sync.waiting,
        );
    }
}

/// One thread's view of a [`ParallelProcessor`] round.
///
/// Holds the private work list and the overflow batches that could not
/// be shared because the store was full. Must be drained before drop.
pub struct Worker<'p, T, S: SharedStore<T>> {
    processor: &'p ParallelProcessor<T, S>,
    index: usize,
    local: VecDeque<T>,
    overflow: VecDeque<Batch<T>>,
}

impl<'p, T: Send, S: SharedStore<T>> Worker<'p, T, S> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.overflow.is_empty()
    }

    /// Add one item of work. When the private list grows past the share
    /// threshold, half of it is moved out where peers can steal it.
    pub fn push(&mut self, item: T) {
        self.local.push_back(item);
        if self.processor.store.sharing_enabled() && self.local.len() >= self.processor.share_threshold
        {
            self.share_surplus();
        }
    }

    /// Move the oldest half of the private list into the shared store,
    /// batch by batch. Batches rejected by a full store stay on the
    /// private overflow list; that is the normal fallback, not an error.
    fn share_surplus(&mut self) {
        let mut to_share = self.local.len() / 2;
        let mut shared_any = false;
        while to_share > 0 {
            let size = to_share.min(self.processor.batch_capacity);
            let mut batch = Batch::new(self.processor.batch_capacity);
            for _ in 0..size {
                if let Some(item) = self.local.pop_front() {
                    batch.push(item);
                }
            }
            to_share -= size;
            match self.processor.store.try_share(self.index, batch) {
                Ok(()) => shared_any = true,
                Err(batch) => self.overflow.push_back(batch),
            }
        }
        if shared_any {
            self.processor.notify_new_work();
        }
    }

    /// Non-blocking: take one item from the private side.
    pub fn pop(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.local.pop_back() {
                return Some(item);
            }
            match self.overflow.pop_front() {
                Some(batch) => self.local.extend(batch.into_items()),
                None => return None,
            }
        }
    }

    /// One bounded stealing attempt: `steal_attempt_cycles` full scans of
    /// the shared store with escalating backoff in between.
    fn try_steal(&mut self) -> bool {
        let backoff = Backoff::new();
        for _ in 0..self.processor.steal_attempt_cycles {
            if let Some(batch) = self.processor.store.try_steal(self.index) {
                self.local.extend(batch.into_items());
                return true;
            }
            backoff.snooze();
        }
        false
    }

    fn acquire(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.try_steal() {
                continue;
            }
            match self.processor.wait_for_work() {
                WaitOutcome::NewWork => continue,
                WaitOutcome::AllDone => return None,
            }
        }
    }

    /// Process work until the round terminates. `process_one` may push
    /// new work discovered transitively; it receives this worker back for
    /// exactly that purpose.
    pub fn perform_work<F>(&mut self, mut process_one: F)
    where
        F: FnMut(&mut Self, T),
    {
        while let Some(item) = self.acquire() {
            process_one(self, item);
        }
        debug_assert!(self.is_empty());
        self.processor.note_worker_exit();
    }
}

impl<'p, T, S: SharedStore<T>> Drop for Worker<'p, T, S> {
    fn drop(&mut self) {
        assert!(
            self.local.is_empty() && self.overflow.is_empty(),
            "worker {} dropped with unprocessed work",
            self.index,
        );
    }
}
