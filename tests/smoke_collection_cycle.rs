//! End-to-end collection cycles over a known object graph: the marked
//! set must be exactly the reachable partition, the swept set exactly
//! the unreachable partition, with finalizers routed to the right queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use marrow::{
    Allocator, Collaborators, ConcurrentMarkSweep, Epoch, FinalizerSink, GcConfig, GcPhase,
    MetricsSink, MutatorThread, ObjectTracer, RootProvider, ScheduleReason, SweepResult,
    WorldStopper,
};

const OBJECT_SIZE: usize = 64;

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    condition()
}

/// A heap of numbered nodes with explicit edges, mark bits, and
/// finalization metadata. Handles are plain node ids.
struct TestHeap {
    edges: Vec<Vec<usize>>,
    global_roots: Vec<usize>,
    thread_roots: HashMap<usize, Vec<usize>>,
    needs_finalizer: Vec<bool>,
    main_thread_only: Vec<bool>,
    marks: Vec<AtomicBool>,
    freed: Vec<AtomicBool>,
    /// Weak edges (holder, target); cleared when the target dies.
    weak_refs: Mutex<Vec<(usize, usize)>>,
    weak_cleared: Mutex<Vec<(usize, usize)>>,
    swept: Mutex<Vec<usize>>,
    marked_at_sweep: Mutex<Vec<usize>>,
    prepare_calls: AtomicUsize,
    /// When set, the first trace call blocks until the signal arrives.
    mark_gate: Mutex<Option<flume::Receiver<()>>>,
}

impl TestHeap {
    fn new(edges: Vec<Vec<usize>>, global_roots: Vec<usize>) -> Self {
        let count = edges.len();
        Self {
            edges,
            global_roots,
            thread_roots: HashMap::new(),
            needs_finalizer: vec![false; count],
            main_thread_only: vec![false; count],
            marks: (0..count).map(|_| AtomicBool::new(false)).collect(),
            freed: (0..count).map(|_| AtomicBool::new(false)).collect(),
            weak_refs: Mutex::new(Vec::new()),
            weak_cleared: Mutex::new(Vec::new()),
            swept: Mutex::new(Vec::new()),
            marked_at_sweep: Mutex::new(Vec::new()),
            prepare_calls: AtomicUsize::new(0),
            mark_gate: Mutex::new(None),
        }
    }

    fn with_thread_roots(mut self, thread_id: usize, roots: Vec<usize>) -> Self {
        self.thread_roots.insert(thread_id, roots);
        self
    }

    fn with_finalizer(mut self, id: usize, main_thread_only: bool) -> Self {
        self.needs_finalizer[id] = true;
        self.main_thread_only[id] = main_thread_only;
        self
    }

    fn with_weak_ref(self, holder: usize, target: usize) -> Self {
        self.weak_refs.lock().push((holder, target));
        self
    }

    fn with_mark_gate(self, gate: flume::Receiver<()>) -> Self {
        *self.mark_gate.lock() = Some(gate);
        self
    }

    fn swept_ids(&self) -> Vec<usize> {
        let mut ids = self.swept.lock().clone();
        ids.sort_unstable();
        ids
    }

    fn marked_ids(&self) -> Vec<usize> {
        let mut ids = self.marked_at_sweep.lock().clone();
        ids.sort_unstable();
        ids
    }
}

impl RootProvider<usize> for TestHeap {
    fn for_each_root(&self, mutator: &MutatorThread, visit: &mut dyn FnMut(usize)) {
        if let Some(roots) = self.thread_roots.get(&mutator.id()) {
            for &root in roots {
                visit(root);
            }
        }
    }

    fn for_each_global_root(&self, visit: &mut dyn FnMut(usize)) {
        for &root in &self.global_roots {
            visit(root);
        }
    }
}

impl ObjectTracer<usize> for TestHeap {
    fn try_mark(&self, item: usize) -> bool {
        !self.marks[item].swap(true, Ordering::AcqRel)
    }

    fn trace(&self, item: usize, visit: &mut dyn FnMut(usize)) {
        if let Some(gate) = self.mark_gate.lock().take() {
            gate.recv_timeout(Duration::from_secs(5))
                .expect("mark gate was never released");
        }
        for &child in &self.edges[item] {
            visit(child);
        }
    }

    fn process_weak_references(&self) {
        let mut weak_refs = self.weak_refs.lock();
        let mut cleared = self.weak_cleared.lock();
        weak_refs.retain(|&(holder, target)| {
            if self.marks[target].load(Ordering::Acquire) {
                true
            } else {
                cleared.push((holder, target));
                false
            }
        });
    }
}

impl Allocator<usize> for TestHeap {
    fn prepare_for_gc(&self) {
        self.prepare_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn sweep(&self, _epoch: Epoch) -> SweepResult<usize> {
        let mut result = SweepResult::default();
        let mut marked_now = Vec::new();
        for id in 0..self.edges.len() {
            if self.freed[id].load(Ordering::Acquire) {
                continue;
            }
            // Consume the mark bit so the next epoch starts clean.
            if self.marks[id].swap(false, Ordering::AcqRel) {
                marked_now.push(id);
                result.kept_bytes += OBJECT_SIZE;
            } else {
                self.freed[id].store(true, Ordering::Release);
                self.swept.lock().push(id);
                if self.needs_finalizer[id] {
                    if self.main_thread_only[id] {
                        result.main_thread_finalizers.push(id);
                    } else {
                        result.regular_finalizers.push(id);
                    }
                }
            }
        }
        *self.marked_at_sweep.lock() = marked_now;
        result
    }

    fn estimate_overhead_per_thread(&self) -> usize {
        0
    }
}

#[derive(Default)]
struct TestWorld {
    stopped: AtomicBool,
    pauses: AtomicUsize,
}

impl WorldStopper for TestWorld {
    fn stop_the_world(&self, _reason: &'static str) {
        let was_stopped = self.stopped.swap(true, Ordering::AcqRel);
        assert!(!was_stopped, "world stopped twice");
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    fn resume_the_world(&self) {
        let was_stopped = self.stopped.swap(false, Ordering::AcqRel);
        assert!(was_stopped, "world resumed while running");
    }
}

#[derive(Default)]
struct CollectingSink {
    received: Mutex<Vec<(Vec<usize>, Epoch)>>,
}

impl CollectingSink {
    fn tasks(&self) -> Vec<(Vec<usize>, Epoch)> {
        self.received.lock().clone()
    }
}

impl FinalizerSink<usize> for CollectingSink {
    fn schedule_tasks(&self, tasks: Vec<usize>, epoch: Epoch) {
        self.received.lock().push((tasks, epoch));
    }
}

#[derive(Default)]
struct CountingMetrics {
    cycles: AtomicUsize,
    last_kept: AtomicUsize,
}

impl MetricsSink for CountingMetrics {
    fn cycle_completed(&self, stats: &marrow::CycleStats) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_kept.store(stats.kept_bytes, Ordering::Relaxed);
    }
}

struct Fixture {
    heap: Arc<TestHeap>,
    world: Arc<TestWorld>,
    regular: Arc<CollectingSink>,
    main_thread: Arc<CollectingSink>,
    metrics: Arc<CountingMetrics>,
}

impl Fixture {
    fn new(heap: TestHeap) -> Self {
        Self {
            heap: Arc::new(heap),
            world: Arc::new(TestWorld::default()),
            regular: Arc::new(CollectingSink::default()),
            main_thread: Arc::new(CollectingSink::default()),
            metrics: Arc::new(CountingMetrics::default()),
        }
    }

    fn collaborators(&self) -> Collaborators<usize> {
        Collaborators {
            roots: self.heap.clone(),
            tracer: self.heap.clone(),
            allocator: self.heap.clone(),
            world: self.world.clone(),
            finalizers: self.regular.clone(),
            main_thread_finalizers: self.main_thread.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Ten nodes. Globally rooted: 0 -> {1, 3}, 1 -> 2. Thread-rooted: 8.
/// Unreachable: 4 -> 5, and the isolated 6, 7, 9. Node 6 needs a
/// main-thread finalizer, node 7 a regular one. Node 2 weakly holds the
/// live 3; node 1 weakly holds the dead 9.
fn partitioned_heap() -> TestHeap {
    TestHeap::new(
        vec![
            vec![1, 3], // 0
            vec![2],    // 1
            vec![],     // 2
            vec![],     // 3
            vec![5],    // 4
            vec![],     // 5
            vec![],     // 6
            vec![],     // 7
            vec![],     // 8
            vec![],     // 9
        ],
        vec![0],
    )
    .with_thread_roots(1, vec![8])
    .with_finalizer(6, true)
    .with_finalizer(7, false)
    .with_weak_ref(2, 3)
    .with_weak_ref(1, 9)
}

#[test]
fn cycle_marks_reachable_and_sweeps_unreachable() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fixture = Fixture::new(partitioned_heap());
    let mut gc = ConcurrentMarkSweep::new(GcConfig::default(), fixture.collaborators());
    let mutator = gc.register_mutator(1);

    let epoch = gc.collect(ScheduleReason::Manual);
    assert_eq!(epoch, 1);

    assert_eq!(fixture.heap.marked_ids(), vec![0, 1, 2, 3, 8]);
    assert_eq!(fixture.heap.swept_ids(), vec![4, 5, 6, 7, 9]);

    // Finalizers land in the right queues, tagged with the epoch.
    assert_eq!(fixture.regular.tasks(), vec![(vec![7], 1)]);
    assert_eq!(fixture.main_thread.tasks(), vec![(vec![6], 1)]);

    // The dead weak target was cleared, the live one kept.
    assert_eq!(fixture.heap.weak_cleared.lock().clone(), vec![(1, 9)]);
    assert_eq!(fixture.heap.weak_refs.lock().clone(), vec![(2, 3)]);

    // Stats and telemetry reflect the cycle.
    let stats = gc.last_cycle();
    assert_eq!(stats.epoch, 1);
    assert_eq!(stats.objects_marked, 5);
    assert_eq!(stats.kept_bytes, 5 * OBJECT_SIZE);
    assert_eq!(stats.regular_finalizers, 1);
    assert_eq!(stats.main_thread_finalizers, 1);
    assert_eq!(fixture.metrics.cycles.load(Ordering::Relaxed), 1);
    assert_eq!(
        fixture.metrics.last_kept.load(Ordering::Relaxed),
        5 * OBJECT_SIZE
    );

    // Exactly one pause, and the world is running again.
    assert_eq!(fixture.world.pauses.load(Ordering::Relaxed), 1);
    assert!(!fixture.world.stopped.load(Ordering::Relaxed));
    assert_eq!(fixture.heap.prepare_calls.load(Ordering::Relaxed), 1);

    // Finalization completes only when the finalizer collaborator says so.
    assert_eq!(gc.epochs().finalized, 0);
    gc.on_finalizers_done(1);
    gc.wait_finalized(1);
    assert_eq!(gc.epochs().finalized, 1);

    drop(mutator);
    gc.shutdown();
}

#[test]
fn second_cycle_over_a_swept_heap_finds_nothing_new() {
    let fixture = Fixture::new(partitioned_heap());
    let mut gc = ConcurrentMarkSweep::new(GcConfig::default(), fixture.collaborators());
    gc.register_mutator(1);

    assert_eq!(gc.collect(ScheduleReason::Manual), 1);
    gc.on_finalizers_done(1);

    assert_eq!(gc.collect(ScheduleReason::Manual), 2);
    // Same live set, nothing newly swept, no finalizers: the epoch
    // finalizes immediately.
    assert_eq!(fixture.heap.marked_ids(), vec![0, 1, 2, 3, 8]);
    assert_eq!(fixture.heap.swept_ids(), vec![4, 5, 6, 7, 9]);
    assert_eq!(fixture.regular.tasks().len(), 1);
    gc.wait_finalized(2);
    assert_eq!(gc.epochs().finalized, 2);

    let snap = gc.epochs();
    assert_eq!((snap.scheduled, snap.started, snap.finished), (2, 2, 2));
    gc.shutdown();
}

#[test]
fn phase_events_follow_the_cycle_order() {
    let fixture = Fixture::new(partitioned_heap());
    let mut gc = ConcurrentMarkSweep::new(GcConfig::default(), fixture.collaborators());

    gc.collect(ScheduleReason::Manual);
    assert!(wait_until(Duration::from_secs(5), || {
        gc.current_phase() == GcPhase::Idle
    }));

    let mut events = Vec::new();
    while let Ok(phase) = gc.phase_events().try_recv() {
        events.push(phase);
    }
    assert_eq!(
        events,
        vec![
            GcPhase::RootCollection,
            GcPhase::ConcurrentMark,
            GcPhase::WeakProcessing,
            GcPhase::Sweep,
            GcPhase::FinalizerHandoff,
            GcPhase::Idle,
        ],
    );
    gc.shutdown();
}

#[test]
fn write_barrier_keeps_concurrently_referenced_objects_alive() {
    // Node 2 is unreachable from the roots; a mutator re-references it
    // while marking is underway. Node 3 stays dead as a control.
    let (gate_tx, gate_rx) = flume::bounded(1);
    let heap = TestHeap::new(vec![vec![1], vec![], vec![], vec![]], vec![0]).with_mark_gate(gate_rx);
    let fixture = Fixture::new(heap);
    let mut gc = ConcurrentMarkSweep::new(GcConfig::default(), fixture.collaborators());

    gc.schedule(ScheduleReason::Manual);
    assert!(
        wait_until(Duration::from_secs(5), || {
            gc.current_phase() == GcPhase::ConcurrentMark
        }),
        "marking never started",
    );

    gc.write_barrier(2);
    gate_tx.send(()).unwrap();

    assert_eq!(gc.collect(ScheduleReason::Manual), 1);
    assert_eq!(fixture.heap.marked_ids(), vec![0, 1, 2]);
    assert_eq!(fixture.heap.swept_ids(), vec![3]);
    gc.shutdown();
}

#[test]
fn mutators_park_at_safepoints_until_the_cycle_completes() {
    let (gate_tx, gate_rx) = flume::bounded(1);
    let heap = TestHeap::new(vec![vec![]], vec![0]).with_mark_gate(gate_rx);
    let fixture = Fixture::new(heap);
    let gc = Arc::new(ConcurrentMarkSweep::new(
        GcConfig::default(),
        fixture.collaborators(),
    ));
    let mutator = gc.register_mutator(1);

    gc.schedule(ScheduleReason::Manual);
    assert!(wait_until(Duration::from_secs(5), || {
        gc.current_phase() == GcPhase::ConcurrentMark
    }));

    let parked = {
        let gc = Arc::clone(&gc);
        let mutator = mutator.clone();
        std::thread::spawn(move || gc.safepoint(&mutator))
    };
    assert!(
        wait_until(Duration::from_secs(5), || {
            mutator.assist().parked_at() == Some(1)
        }),
        "mutator never parked",
    );

    gate_tx.send(()).unwrap();
    parked.join().unwrap();
    assert!(mutator.assist().passed_epoch(1));
    assert_eq!(gc.epochs().finished, 1);
}

#[test]
fn allocation_volume_triggers_a_cycle() {
    let fixture = Fixture::new(partitioned_heap());
    let config = GcConfig {
        allocation_trigger_bytes: 1_000,
        ..GcConfig::default()
    };
    let mut gc = ConcurrentMarkSweep::new(config, fixture.collaborators());
    let mutator = gc.register_mutator(1);

    gc.allocated(&mutator, 400);
    assert_eq!(gc.epochs().scheduled, 0);

    gc.allocated(&mutator, 800);
    assert_eq!(gc.epochs().scheduled, 1);

    assert!(
        wait_until(Duration::from_secs(5), || gc.epochs().finished >= 1),
        "triggered cycle never ran",
    );
    // The volume counter was reset at root collection.
    gc.allocated(&mutator, 100);
    assert_eq!(gc.epochs().scheduled, 1);
    gc.shutdown();
}

#[test]
fn regular_interval_schedules_timer_cycles() {
    let fixture = Fixture::new(partitioned_heap());
    let config = GcConfig {
        regular_gc_interval: Some(Duration::from_millis(20)),
        ..GcConfig::default()
    };
    let mut gc = ConcurrentMarkSweep::new(config, fixture.collaborators());

    assert!(
        wait_until(Duration::from_secs(5), || gc.epochs().finished >= 1),
        "no timer-triggered cycle ran",
    );
    gc.shutdown();
}

#[test]
fn aggressive_mode_schedules_from_fresh_safepoint_sites() {
    let fixture = Fixture::new(partitioned_heap());
    let config = GcConfig {
        aggressive: true,
        ..GcConfig::default()
    };
    let mut gc = ConcurrentMarkSweep::new(config, fixture.collaborators());
    let mutator = gc.register_mutator(1);

    gc.safepoint(&mutator);
    assert!(gc.epochs().scheduled >= 1);
    gc.shutdown();
}
