//! Time-ordered delay list for failed jobs.

use std::time::Duration;
use tokio::time::Instant;

use crate::time;

use super::job::Job;

/// What to do with a job whose processor failed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    /// Multiplier applied per further retry; 1.0 keeps the delay fixed.
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Subtracted from a job's priority each time it is re-queued.
    pub priority_decrement: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(300),
            priority_decrement: 1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the `retry`-th attempt (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.backoff_factor <= 1.0 || retry <= 1 {
            return self.delay;
        }
        let exp = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.delay.as_secs_f64() * self.backoff_factor.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Outcome of [`RetryScheduler::schedule`].
#[derive(Debug)]
pub enum Scheduled<T> {
    /// Parked until the returned instant.
    At(Instant),
    /// Retry budget spent; the job is handed back for the terminal drop.
    Exhausted(Job<T>),
}

/// Failed jobs sorted by the instant they become eligible again.
#[derive(Debug)]
pub struct RetryScheduler<T> {
    policy: RetryPolicy,
    delayed: Vec<(Instant, Job<T>)>,
}

impl<T> RetryScheduler<T> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            delayed: Vec::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Parks a failed job, or hands it back once `max_retries` is reached.
    pub fn schedule(&mut self, mut job: Job<T>, now: Instant) -> Scheduled<T> {
        if job.retries >= self.policy.max_retries {
            return Scheduled::Exhausted(job);
        }
        job.retries += 1;
        let due = time::after(now, self.policy.delay_for(job.retries));
        // Equal due times keep arrival order.
        let at = self.delayed.partition_point(|(when, _)| *when <= due);
        self.delayed.insert(at, (due, job));
        Scheduled::At(due)
    }

    /// Removes every job due at or before `now`, in due order, with priorities lowered.
    pub fn take_due(&mut self, now: Instant) -> Vec<Job<T>> {
        let end = self.delayed.partition_point(|(when, _)| *when <= now);
        let decrement = self.policy.priority_decrement;
        self.delayed
            .drain(..end)
            .map(|(_, mut job)| {
                job.priority = job.priority.saturating_sub(decrement);
                job
            })
            .collect()
    }

    /// Earliest due instant, if anything is parked.
    pub fn next_due(&self) -> Option<Instant> {
        self.delayed.first().map(|(when, _)| *when)
    }

    pub fn len(&self) -> usize {
        self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delayed.is_empty()
    }
}
