//! Bounded, priority-ordered in-memory job list.

use std::collections::VecDeque;

use super::job::Job;

/// Jobs ordered by descending priority, FIFO among equal priorities.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    items: VecDeque<Job<T>>,
    capacity: usize,
}

impl<T> PriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Inserts before the first job with strictly lower priority.
    ///
    /// Hands the job back when the queue is at capacity; the caller owns overflow handling.
    pub fn enqueue(&mut self, job: Job<T>) -> Result<(), Job<T>> {
        if self.items.len() >= self.capacity {
            return Err(job);
        }
        // Items are sorted descending, so "priority >= job.priority" is a true prefix.
        let at = self.items.partition_point(|queued| queued.priority >= job.priority);
        self.items.insert(at, job);
        Ok(())
    }

    /// Removes up to `n` highest-priority jobs in one range removal.
    pub fn dequeue_batch(&mut self, n: usize) -> Vec<Job<T>> {
        let n = n.min(self.items.len());
        self.items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
