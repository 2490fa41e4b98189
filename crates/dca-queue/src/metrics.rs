//! Per-queue delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for one delivery queue.
///
/// The writer bumps `enqueued`, the consumer task bumps `delivered` or
/// `failed`. Everything uses relaxed atomics; readers get a best-effort view.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl QueueMetrics {
    /// Items accepted into the queue.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Items whose delivery callback returned `Ok`.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Items whose delivery callback returned an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Items refused because the queue was completed or aborted.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Items accepted but not yet handed to the callback.
    pub fn backlog(&self) -> u64 {
        self.enqueued()
            .saturating_sub(self.delivered() + self.failed())
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}
