//! Concurrent mark-and-sweep collection core for managed-language
//! runtimes.
//!
//! This crate is the orchestration and concurrency layer of a garbage
//! collector: epoch scheduling and request coalescing, mutator
//! backpressure, a work-stealing marking engine with symmetric
//! termination detection, and the cycle driver that sequences
//! stop-the-world root collection, concurrent marking, weak-reference
//! processing, sweep, and finalizer hand-off. The object model, the
//! allocator, thread suspension, and finalizer execution are consumed
//! through the capability traits in [`traits`]; the core only ever sees
//! opaque object handles.

pub mod assists;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod parallel;
pub mod safepoint;
pub mod scheduler;
pub mod thread;
pub mod traits;
pub mod types;

pub use assists::{AssistState, MutatorAssists};
pub use config::GcConfig;
pub use coordinator::{Collaborators, ConcurrentMarkSweep};
pub use error::{GcError, GcResult};
pub use parallel::{
    Batch, GlobalQueue, NoSharing, ParallelProcessor, PerWorkerSegments, SharedStore, Worker,
};
pub use safepoint::SafePointTracker;
pub use scheduler::{EpochScheduler, EpochSnapshot, EpochState, NextEpoch, ScheduleGc};
pub use thread::{MutatorThread, ThreadRegistry};
pub use traits::{
    Allocator, FinalizerSink, MetricsSink, NullMetrics, ObjectTracer, RootProvider, WorldStopper,
};
pub use types::{CycleStats, Epoch, GcPhase, ScheduleReason, SweepResult};
