// Counters for queue operations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters for one queue.
#[derive(Debug, Default)]
pub struct Counters {
    /// Jobs accepted by `add`, in memory or on disk.
    pub accepted: AtomicU64,
    /// Jobs refused by `add` (queue full, no overflow or overflow write failed).
    pub rejected: AtomicU64,
    /// Processor runs that succeeded.
    pub completed: AtomicU64,
    /// Processor runs that failed and were parked for retry.
    pub retried: AtomicU64,
    /// Jobs dropped for good after exhausting retries or losing re-admission.
    pub failed: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
