//! Bounded queue between push adapters and the bus pump
//!
//! Policy is explicit per queue: `Oldest` drops the oldest buffered update
//! and counts it (acceptable for idempotent snapshot-style updates),
//! `Block` parks the producer until space frees up (for streams where loss
//! is unacceptable).

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tagmine_config::DropPolicy;

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_full: Condvar,
    capacity: usize,
    policy: DropPolicy,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue one item, applying the drop policy when full
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        match self.policy {
            DropPolicy::Oldest => {
                if items.len() == self.capacity {
                    items.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                items.push_back(item);
            }
            DropPolicy::Block => {
                while items.len() == self.capacity {
                    self.not_full.wait(&mut items);
                }
                items.push_back(item);
            }
        }
    }

    /// Dequeue up to `max` items in arrival order
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let n = items.len().min(max);
        let drained: Vec<T> = items.drain(..n).collect();
        if n > 0 {
            self.not_full.notify_all();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Updates lost to the Oldest policy since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
