//! Fixed-capacity containers of work items.
//!
//! A batch moves between a worker's private storage and the shared pool
//! as one unit, amortizing synchronization over `capacity` items.

#[derive(Debug)]
pub struct Batch<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> Batch<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "batch capacity must be non-zero");
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Add `item`. Pushing into a full batch is a caller bug.
    pub fn push(&mut self, item: T) {
        assert!(!self.is_full(), "push into a full batch");
        self.items.push(item);
    }

    /// Remove the most recently added item. Popping an empty batch is a
    /// caller bug.
    pub fn pop(&mut self) -> T {
        assert!(!self.items.is_empty(), "pop from an empty batch");
        self.items.pop().unwrap()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}
