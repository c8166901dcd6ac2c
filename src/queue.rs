// ===============================
// src/queue.rs
// ===============================
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::metrics::QUEUE_DEPTH;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    counts: Counts,
}

/// Shared work queue; items and counters sit behind one lock.
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> WorkQueue<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items.len();
        QUEUE_DEPTH.set(total as i64);
        Self { inner: Mutex::new(Inner { items: items.into(), counts: Counts { total, ..Default::default() } }) }
    }

    pub fn next(&self) -> Option<T> {
        let mut g = self.inner.lock();
        let item = g.items.pop_front();
        QUEUE_DEPTH.set(g.items.len() as i64);
        item
    }

    pub fn mark_success(&self) {
        let mut g = self.inner.lock();
        g.counts.processed += 1;
        g.counts.success += 1;
    }

    pub fn mark_failure(&self) {
        let mut g = self.inner.lock();
        g.counts.processed += 1;
        g.counts.failed += 1;
    }

    pub fn progress(&self) -> String {
        let c = self.inner.lock().counts;
        format!("[{}/{}] ok:{} failed:{}", c.processed, c.total, c.success, c.failed)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }
}
