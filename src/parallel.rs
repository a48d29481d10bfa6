//! Generic many-producer many-consumer work distribution.
//!
//! Batches of trace work are pushed by any worker, popped from the
//! worker's own list first, then stolen from peers; workers sleep
//! cooperatively when no work is found and wake on new work or global
//! termination. The marking phase of the collector runs on top of this
//! engine, but nothing in here knows about objects: items are opaque.

pub mod batch;
pub mod processor;
pub mod worklist;

pub use batch::Batch;
pub use processor::{ParallelProcessor, Worker};
pub use worklist::{GlobalQueue, NoSharing, PerWorkerSegments, SharedStore};
