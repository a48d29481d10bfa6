//! Cooperative work-sharing strategies.
//!
//! A [`SharedStore`] decides where shared batches live. Producers never
//! block on a full store: the batch is handed back and stays on the
//! worker's private overflow list until it can be processed locally.

use crossbeam::queue::ArrayQueue;

use super::batch::Batch;

pub trait SharedStore<T>: Send + Sync {
    /// False when this strategy never shares work across workers.
    fn sharing_enabled(&self) -> bool {
        true
    }

    /// Offer a batch for peers to steal. `Err` hands the batch back when
    /// the store is at capacity. Sharing an empty batch is a caller bug.
    fn try_share(&self, worker: usize, batch: Batch<T>) -> Result<(), Batch<T>>;

    /// Take one batch, checking the worker's own segment before peers.
    fn try_steal(&self, worker: usize) -> Option<Batch<T>>;

    fn is_empty(&self) -> bool;
}

/// Private lists only; no cross-worker stealing. The right choice when
/// parallelism is not needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSharing;

impl<T: Send> SharedStore<T> for NoSharing {
    fn sharing_enabled(&self) -> bool {
        false
    }

    fn try_share(&self, _worker: usize, batch: Batch<T>) -> Result<(), Batch<T>> {
        Err(batch)
    }

    fn try_steal(&self, _worker: usize) -> Option<Batch<T>> {
        None
    }

    fn is_empty(&self) -> bool {
        true
    }
}

/// One bounded segment per worker. A worker shares into its own segment;
/// a worker with no local work scans the other segments round-robin,
/// starting just past itself.
pub struct PerWorkerSegments<T> {
    segments: Box<[ArrayQueue<Batch<T>>]>,
}

impl<T> PerWorkerSegments<T> {
    pub fn new(workers: usize, segment_capacity: usize) -> Self {
        assert!(workers > 0, "segment store needs at least one worker");
        assert!(segment_capacity > 0, "segment capacity must be non-zero");
        let segments = (0..workers)
            .map(|_| ArrayQueue::new(segment_capacity))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { segments }
    }
}

impl<T: Send> SharedStore<T> for PerWorkerSegments<T> {
    fn try_share(&self, worker: usize, batch: Batch<T>) -> Result<(), Batch<T>> {
        assert!(!batch.is_empty(), "sharing an empty batch");
        self.segments[worker].push(batch)
    }

    fn try_steal(&self, worker: usize) -> Option<Batch<T>> {
        let count = self.segments.len();
        for offset in 0..count {
            let index = (worker + offset) % count;
            if let Some(batch) = self.segments[index].pop() {
                return Some(batch);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.is_empty())
    }
}

/// All sharing funnels through one bounded queue. Simpler than
/// per-worker segments, more contention.
pub struct GlobalQueue<T> {
    queue: ArrayQueue<Batch<T>>,
}

impl<T> GlobalQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "global queue capacity must be non-zero");
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }
}

impl<T: Send> SharedStore<T> for GlobalQueue<T> {
    fn try_share(&self, _worker: usize, batch: Batch<T>) -> Result<(), Batch<T>> {
        assert!(!batch.is_empty(), "sharing an empty batch");
        self.queue.push(batch)
    }

    fn try_steal(&self, _worker: usize) -> Option<Batch<T>> {
        self.queue.pop()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
