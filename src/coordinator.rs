//! Top-level concurrent mark-and-sweep driver.
//!
//! One dedicated collector thread runs the outer loop: wait for the next
//! scheduled epoch, then sequence one full cycle through
//! root collection (stop-the-world) -> concurrent mark -> weak
//! processing -> sweep -> finalizer hand-off. Phase ordering is enforced
//! structurally by that single thread; in particular, weak processing
//! only starts after the marking engine's termination protocol has
//! fired, so mark bits are final there.
//!
//! A cycle is never retried. If anything inside a cycle asserts, the
//! process terminates: a collection invariant violation cannot be safely
//! continued past.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use arc_swap::ArcSwap;
use crossbeam::queue::SegQueue;
use flume::{Receiver, Sender};
use log::{debug, info, trace};

use crate::assists::MutatorAssists;
use crate::config::GcConfig;
use crate::parallel::{NoSharing, ParallelProcessor};
use crate::safepoint::SafePointTracker;
use crate::scheduler::{EpochScheduler, EpochState, EpochSnapshot, NextEpoch};
use crate::thread::{MutatorThread, ThreadRegistry};
use crate::traits::{
    Allocator, FinalizerSink, MetricsSink, ObjectTracer, RootProvider, WorldStopper,
};
use crate::types::{CycleStats, Epoch, GcPhase, ScheduleReason};

/// The runtime collaborators one cycle is driven through.
pub struct Collaborators<T> {
    pub roots: Arc<dyn RootProvider<T>>,
    pub tracer: Arc<dyn ObjectTracer<T>>,
    pub allocator: Arc<dyn Allocator<T>>,
    pub world: Arc<dyn WorldStopper>,
    /// Receives finalizers that may run on any finalizer thread.
    pub finalizers: Arc<dyn FinalizerSink<T>>,
    /// Receives finalizers restricted to the designated main thread.
    pub main_thread_finalizers: Arc<dyn FinalizerSink<T>>,
    pub metrics: Arc<dyn MetricsSink>,
}

struct Inner<T> {
    config: GcConfig,
    state: Arc<EpochState>,
    scheduler: EpochScheduler,
    assists: MutatorAssists,
    registry: ThreadRegistry,
    tracker: Option<SafePointTracker>,
    collab: Collaborators<T>,
    /// Grey objects fed back by mutator write barriers during marking.
    barrier_queue: SegQueue<T>,
    marking_active: AtomicBool,
    allocated_since_cycle: AtomicUsize,
    last_cycle: ArcSwap<CycleStats>,
    current_phase: ArcSwap<GcPhase>,
    phase_events: Sender<GcPhase>,
}

/// The collection core. Owns the dedicated collector thread along with
/// the epoch scheduler, the backpressure controller, and the marking
/// engine, and exposes the mutator-facing entry points.
pub struct ConcurrentMarkSweep<T: Copy + Send + 'static> {
    inner: Arc<Inner<T>>,
    phase_receiver: Receiver<GcPhase>,
    collector: Option<JoinHandle<()>>,
}

impl<T: Copy + Send + 'static> ConcurrentMarkSweep<T> {
    /// Build the core and start its collector thread.
    ///
    /// Configuration is validated here; recognized-but-unimplemented
    /// options are fatal at startup rather than silently ignored.
    pub fn new(config: GcConfig, collab: Collaborators<T>) -> Self {
        config.validate().expect("invalid GC configuration");

        let state = Arc::new(EpochState::new());
        let scheduler = {
            let state = Arc::clone(&state);
            EpochScheduler::new(Box::new(move |_reason| state.schedule()))
        };
        let tracker = config
            .aggressive
            .then(|| SafePointTracker::new(config.fingerprint_capacity, config.fingerprint_depth));
        let (phase_events, phase_receiver) = flume::bounded(64);

        let inner = Arc::new(Inner {
            config,
            state,
            scheduler,
            assists: MutatorAssists::new(),
            registry: ThreadRegistry::new(),
            tracker,
            collab,
            barrier_queue: SegQueue::new(),
            marking_active: AtomicBool::new(false),
            allocated_since_cycle: AtomicUsize::new(0),
            last_cycle: ArcSwap::from_pointee(CycleStats::default()),
            current_phase: ArcSwap::from_pointee(GcPhase::Idle),
            phase_events,
        });

        let collector = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("gc-collector".into())
                .spawn(move || collector_loop(&inner))
                .expect("failed to spawn gc-collector thread")
        };

        Self {
            inner,
            phase_receiver,
            collector: Some(collector),
        }
    }

    /// Request a collection. Coalesces with any outstanding epoch.
    pub fn schedule(&self, reason: ScheduleReason) -> Epoch {
        self.inner.scheduler.schedule_next_epoch(reason)
    }

    /// Cheap variant for hot call sites: once an epoch is outstanding,
    /// returns it without touching the underlying scheduling path.
    pub fn schedule_if_not_in_progress(&self, reason: ScheduleReason) -> Epoch {
        self.inner
            .scheduler
            .schedule_next_epoch_if_not_in_progress(reason)
    }

    /// Request a collection and block until its epoch has finished.
    pub fn collect(&self, reason: ScheduleReason) -> Epoch {
        let epoch = self.schedule(reason);
        self.inner.state.wait_epoch_finished(epoch);
        epoch
    }

    /// Block until every finalizer of `epoch` has run.
    pub fn wait_finalized(&self, epoch: Epoch) {
        self.inner.state.wait_epoch_finalized(epoch);
    }

    /// Register the calling thread as a mutator.
    pub fn register_mutator(&self, id: usize) -> MutatorThread {
        let thread = MutatorThread::new(id);
        self.inner.registry.register(thread.clone());
        thread
    }

    pub fn unregister_mutator(&self, id: usize) -> Option<MutatorThread> {
        self.inner.registry.unregister(id)
    }

    /// Mutator-side cooperative checkpoint. Parks the calling thread
    /// while assists are demanded for an unfinished epoch. In aggressive
    /// configurations, a previously unseen call site also nudges the
    /// scheduler.
    pub fn safepoint(&self, mutator: &MutatorThread) {
        if let Some(tracker) = &self.inner.tracker {
            if tracker.register_current_safe_point() {
                self.schedule_if_not_in_progress(ScheduleReason::SafePoint);
            }
        }
        self.inner.assists.safepoint(mutator.assist());
    }

    /// Account `bytes` of allocation on `mutator`, scheduling a cycle
    /// when the volume since the last one crosses the trigger.
    pub fn allocated(&self, mutator: &MutatorThread, bytes: usize) {
        mutator.note_allocation(bytes);
        let total = self
            .inner
            .allocated_since_cycle
            .fetch_add(bytes, Ordering::Relaxed)
            + bytes;
        let overhead =
            self.inner.collab.allocator.estimate_overhead_per_thread() * self.inner.registry.len();
        if total + overhead >= self.inner.config.allocation_trigger_bytes {
            self.schedule_if_not_in_progress(ScheduleReason::AllocationTrigger { bytes: total });
        }
    }

    /// Mutator write barrier: feed a newly referenced object back into
    /// the marking engine instead of requiring a second full trace.
    /// No-op outside the marking phase.
    pub fn write_barrier(&self, item: T) {
        if self.inner.marking_active.load(Ordering::Acquire) {
            self.inner.barrier_queue.push(item);
        }
    }

    /// Finalizer collaborator callback: every finalizer of `epoch` ran.
    pub fn on_finalizers_done(&self, epoch: Epoch) {
        self.inner.state.finalized(epoch);
    }

    pub fn current_phase(&self) -> GcPhase {
        **self.inner.current_phase.load()
    }

    /// Lossy stream of phase transitions, for tests and observers.
    pub fn phase_events(&self) -> &Receiver<GcPhase> {
        &self.phase_receiver
    }

    pub fn last_cycle(&self) -> Arc<CycleStats> {
        self.inner.last_cycle.load_full()
    }

    pub fn epochs(&self) -> EpochSnapshot {
        self.inner.state.snapshot()
    }

    pub fn assists(&self) -> &MutatorAssists {
        &self.inner.assists
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.inner.registry
    }

    /// Stop the collector thread after its current cycle, if any.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.inner.state.request_shutdown();
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
    }
}

impl<T: Copy + Send + 'static> Drop for ConcurrentMarkSweep<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn collector_loop<T: Copy + Send + 'static>(inner: &Inner<T>) {
    debug!("collector thread started");
    loop {
        let next = match inner.config.regular_gc_interval {
            Some(interval) => inner.state.wait_next_epoch_for(interval),
            None => inner.state.wait_next_epoch(),
        };
        match next {
            NextEpoch::Shutdown => break,
            NextEpoch::TimedOut => {
                inner
                    .scheduler
                    .schedule_next_epoch_if_not_in_progress(ScheduleReason::Timer);
            }
            NextEpoch::Scheduled(epoch) => run_cycle(inner, epoch),
        }
    }
    debug!("collector thread exiting");
}

fn set_phase<T>(inner: &Inner<T>, phase: GcPhase) {
    // Event first: an observer that polls `current_phase` must find the
    // matching event already queued.
    let _ = inner.phase_events.try_send(phase);
    inner.current_phase.store(Arc::new(phase));
    trace!("phase: {:?}", phase);
}

fn run_cycle<T: Copy + Send + 'static>(inner: &Inner<T>, epoch: Epoch) {
    inner.state.start(epoch);
    inner.assists.request_assists(epoch);
    debug!("epoch {}: cycle starting", epoch);

    // Root collection: the only phase where every mutator is paused.
    set_phase(inner, GcPhase::RootCollection);
    let pause_start = Instant::now();
    inner.collab.world.stop_the_world("root collection");
    inner.collab.allocator.prepare_for_gc();
    inner.allocated_since_cycle.store(0, Ordering::Relaxed);

    let mut roots = Vec::new();
    inner
        .collab
        .roots
        .for_each_global_root(&mut |item| roots.push(item));
    for mutator in inner.registry.iter() {
        mutator.reset_allocated();
        inner
            .collab
            .roots
            .for_each_root(&mutator, &mut |item| roots.push(item));
    }

    inner.marking_active.store(true, Ordering::Release);
    inner.collab.world.resume_the_world();
    let root_pause = pause_start.elapsed();

    set_phase(inner, GcPhase::ConcurrentMark);
    let mark_start = Instant::now();
    let objects_marked = mark(inner, roots);
    inner.marking_active.store(false, Ordering::Release);
    let mark_time = mark_start.elapsed();

    // Marking has terminated: no new reachable object can appear, so the
    // mark bits the weak pass reads are final.
    set_phase(inner, GcPhase::WeakProcessing);
    inner.collab.tracer.process_weak_references();

    set_phase(inner, GcPhase::Sweep);
    let swept = inner.collab.allocator.sweep(epoch);

    set_phase(inner, GcPhase::FinalizerHandoff);
    let regular = swept.regular_finalizers.len();
    let main_thread = swept.main_thread_finalizers.len();
    if regular > 0 {
        inner
            .collab
            .finalizers
            .schedule_tasks(swept.regular_finalizers, epoch);
    }
    if main_thread > 0 {
        inner
            .collab
            .main_thread_finalizers
            .schedule_tasks(swept.main_thread_finalizers, epoch);
    }

    let stats = CycleStats {
        epoch,
        root_pause,
        mark_time,
        objects_marked,
        kept_bytes: swept.kept_bytes,
        regular_finalizers: regular,
        main_thread_finalizers: main_thread,
    };
    inner.last_cycle.store(Arc::new(stats.clone()));
    inner.collab.metrics.cycle_completed(&stats);

    inner.state.finish(epoch);
    inner.scheduler.on_gc_finish(epoch);
    inner.assists.mark_epoch_completed(epoch);
    if regular == 0 && main_thread == 0 {
        inner.state.finalized(epoch);
    }
    set_phase(inner, GcPhase::Idle);
    info!(
        "epoch {}: marked {} objects, kept {} bytes, {} finalizers ({} main thread), \
         root pause {:?}, mark {:?}",
        epoch, objects_marked, stats.kept_bytes, regular, main_thread, root_pause, mark_time,
    );
}

/// Drive the marking engine over the root set until it terminates and
/// the write-barrier feed is drained.
fn mark<T: Copy + Send + 'static>(inner: &Inner<T>, roots: Vec<T>) -> usize {
    let expected_workers = 1 + inner.config.aux_gc_threads;
    let processor = ParallelProcessor::new(
        NoSharing,
        expected_workers,
        inner.config.batch_capacity,
        inner.config.share_threshold,
        inner.config.steal_attempt_cycles,
    );
    let mut worker = processor.register_worker();
    for item in roots {
        worker.push(item);
    }

    let mut marked = 0usize;
    loop {
        worker.perform_work(|w, item| {
            if inner.collab.tracer.try_mark(item) {
                marked += 1;
                inner.collab.tracer.trace(item, &mut |child| w.push(child));
            }
            while let Some(extra) = inner.barrier_queue.pop() {
                w.push(extra);
            }
        });

        // The engine terminated, but barriers may have queued more grey
        // objects in the meantime; rearm and keep marking until the feed
        // is empty at termination.
        let mut resumed = false;
        while let Some(extra) = inner.barrier_queue.pop() {
            if !resumed {
                processor.reset_for_new_work();
                resumed = true;
            }
            worker.push(extra);
        }
        if !resumed {
            break;
        }
    }
    marked
}
