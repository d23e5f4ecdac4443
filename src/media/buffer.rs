//! Bounded ingress buffers
//!
//! Units from every peer of one media kind are merged into a single
//! [`IngressBuffer`]. Admission is FIFO; when the buffer is full the oldest
//! unit is evicted so a writer never blocks.
//!
//! Video consumers read the newest unit without removing it
//! ([`IngressBuffer::latest`]); audio consumers pop the oldest
//! ([`IngressBuffer::pop_oldest`]).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed-capacity buffer with drop-oldest overflow
pub struct IngressBuffer<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    /// Total insertions; doubles as the generation number of the newest unit
    pushed: AtomicU64,
    overflow_count: AtomicU64,
    underrun_count: AtomicU64,
}

impl<T: Clone> IngressBuffer<T> {
    /// Create a buffer holding at most `capacity` units (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            pushed: AtomicU64::new(0),
            overflow_count: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
        }
    }

    /// Append a unit, evicting the oldest if full. Returns true if a unit was evicted.
    pub fn push(&self, unit: T) -> bool {
        let mut queue = self.queue.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front();
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        };
        queue.push_back(unit);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    /// Newest unit and its generation, without removing it
    pub fn latest(&self) -> Option<(u64, T)> {
        let queue = self.queue.lock();
        queue
            .back()
            .map(|unit| (self.pushed.load(Ordering::Relaxed), unit.clone()))
    }

    /// Remove and return the oldest unit; an empty read counts as an underrun
    pub fn pop_oldest(&self) -> Option<T> {
        let unit = self.queue.lock().pop_front();
        if unit.is_none() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        unit
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Generation of the newest unit (0 before the first push)
    pub fn generation(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            len: self.len(),
            capacity: self.capacity,
            pushed: self.pushed.load(Ordering::Relaxed),
            overflows: self.overflow_count.load(Ordering::Relaxed),
            underruns: self.underrun_count.load(Ordering::Relaxed),
        }
    }
}

/// Buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub overflows: u64,
    pub underruns: u64,
}

/// Thread-safe handle to an ingress buffer
pub type SharedBuffer<T> = Arc<IngressBuffer<T>>;
