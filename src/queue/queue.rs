//! Bounded-concurrency job queue: priority dispatch, delayed retries, disk overflow.

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigTrait};
use crate::dedlog;
use crate::lockfile::LockOptions;
use crate::safe::panic_message;

use super::counters::Counters;
use super::job::{Job, JobId, Payload};
use super::overflow::{OverflowOptions, OverflowStore, RecoveryReport};
use super::priority::PriorityQueue;
use super::retry::{RetryPolicy, RetryScheduler, Scheduled};
use super::telemetry;

const COMPONENT: &str = "queue";

type ProcessorFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Queue construction options.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub concurrency: usize,
    pub max_queue_size: usize,
    pub retry: RetryPolicy,
    /// Caller-side limit on a single processor run; the run is abandoned, not cancelled.
    pub job_timeout: Option<Duration>,
    /// Job starts per second.
    pub rate: Option<NonZeroU32>,
    pub overflow: Option<OverflowOptions>,
    pub stats_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "jobs".to_string(),
            concurrency: num_cpus::get(),
            max_queue_size: 10_000,
            retry: RetryPolicy::default(),
            job_timeout: None,
            rate: None,
            overflow: None,
            stats_interval: Duration::from_secs(10),
        }
    }
}

impl QueueOptions {
    /// Builds options from the `queue` and `overflow` config sections.
    pub fn from_config(cfg: &Config) -> Self {
        let mut opts = Self::default();

        if let Some(q) = cfg.queue() {
            if let Some(name) = &q.name {
                opts.name = name.clone();
            }
            opts.concurrency = q.concurrency.unwrap_or(opts.concurrency);
            opts.max_queue_size = q.max_queue_size.unwrap_or(opts.max_queue_size);
            opts.retry = RetryPolicy {
                max_retries: q.max_retries.unwrap_or(opts.retry.max_retries),
                delay: q.retry_delay.unwrap_or(opts.retry.delay),
                backoff_factor: q.backoff_factor.unwrap_or(opts.retry.backoff_factor),
                max_delay: q.max_retry_delay.unwrap_or(opts.retry.max_delay),
                priority_decrement: q.priority_decrement.unwrap_or(opts.retry.priority_decrement),
            };
            opts.job_timeout = q.job_timeout;
            opts.rate = q.rate.and_then(NonZeroU32::new);
            opts.stats_interval = q.stats_interval.unwrap_or(opts.stats_interval);
        }

        if let Some(o) = cfg.overflow().filter(|o| o.enabled) {
            if let Some(path) = &o.path {
                let defaults = LockOptions::default();
                let mut overflow = OverflowOptions::new(path.clone());
                overflow.recover_interval = o.recover_interval.unwrap_or(overflow.recover_interval);
                overflow.lock = LockOptions {
                    stale_after: o.lock_stale_after.unwrap_or(defaults.stale_after),
                    max_attempts: o.lock_attempts.unwrap_or(defaults.max_attempts),
                    backoff: o.lock_backoff.unwrap_or(defaults.backoff),
                    max_backoff: o.lock_max_backoff.unwrap_or(defaults.max_backoff),
                };
                opts.overflow = Some(overflow);
            }
        }

        opts
    }
}

/// Point-in-time queue status.
///
/// `total` counts every job held in memory: queued, processing and waiting for retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: usize,
    pub delayed: usize,
    pub total: usize,
    pub overflow_persisted: u64,
    pub overflow_recovered: u64,
    pub accepted: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub rejected: u64,
}

struct State<T> {
    pending: PriorityQueue<T>,
    retry: RetryScheduler<T>,
    in_flight: usize,
    processor: Option<ProcessorFn<T>>,
    next_id: JobId,
}

struct Inner<T> {
    opts: QueueOptions,
    state: Mutex<State<T>>,
    overflow: Option<OverflowStore<T>>,
    counters: Counters,
    retry_wake: Notify,
    recover_now: Notify,
    limiter: Option<DefaultDirectRateLimiter>,
    shutdown: CancellationToken,
}

/// Handle to a job queue. Clones share the same queue.
///
/// One instance per logical queue; construct it once at startup and pass it to the
/// producers and the code that registers the processor.
pub struct Queue<T: Payload> {
    inner: Arc<Inner<T>>,
}

impl<T: Payload> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> Queue<T> {
    /// Creates the queue and starts its retry, recovery and telemetry loops.
    ///
    /// Loops stop when `shutdown` is cancelled or [`Queue::close`] is called.
    pub fn new(shutdown: CancellationToken, opts: QueueOptions) -> Self {
        let opts = QueueOptions {
            concurrency: opts.concurrency.max(1),
            max_queue_size: opts.max_queue_size.max(1),
            ..opts
        };
        let limiter = opts.rate.map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        let overflow = opts.overflow.clone().map(OverflowStore::new);

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                pending: PriorityQueue::new(opts.max_queue_size),
                retry: RetryScheduler::new(opts.retry.clone()),
                in_flight: 0,
                processor: None,
                next_id: 1,
            }),
            overflow,
            counters: Counters::new(),
            retry_wake: Notify::new(),
            recover_now: Notify::new(),
            limiter,
            shutdown: shutdown.child_token(),
            opts,
        });

        tokio::spawn(Arc::clone(&inner).retry_loop());
        if inner.overflow.is_some() {
            tokio::spawn(Arc::clone(&inner).recovery_loop());
        }

        let queue = Self { inner };
        let observed = queue.clone();
        tokio::spawn(async move {
            telemetry::logger(observed).await;
        });

        info!(
            component = COMPONENT,
            event = "created",
            name = %queue.inner.opts.name,
            concurrency = queue.inner.opts.concurrency,
            max_queue_size = queue.inner.opts.max_queue_size,
            overflow = queue.inner.overflow.is_some(),
            "queue created"
        );
        queue
    }

    pub fn name(&self) -> &str {
        &self.inner.opts.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.opts
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Registers the processor. A later registration replaces the earlier one.
    ///
    /// The first registration also triggers an immediate overflow recovery pass.
    pub fn process<F, Fut>(&self, processor: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let processor: ProcessorFn<T> = Arc::new(move |payload| processor(payload).boxed());
        let first = {
            let mut st = self.inner.state.lock();
            let first = st.processor.is_none();
            st.processor = Some(processor);
            first
        };

        if first && self.inner.overflow.is_some() {
            self.inner.recover_now.notify_one();
        }
        self.inner.dispatch();
    }

    /// Submits a job.
    ///
    /// Returns `None` when the queue is full and the job could not be spilled to disk.
    pub async fn add(&self, payload: T, priority: i32) -> Option<JobId> {
        let (id, rejected) = {
            let mut st = self.inner.state.lock();
            let id = st.next_id;
            st.next_id += 1;
            (id, st.pending.enqueue(Job::new(id, payload, priority)).err())
        };

        let Some(job) = rejected else {
            Counters::inc(&self.inner.counters.accepted);
            self.inner.dispatch();
            return Some(id);
        };

        let spilled = match &self.inner.overflow {
            Some(store) => store.persist(&job).await,
            None => false,
        };
        if spilled {
            Counters::inc(&self.inner.counters.accepted);
            Some(id)
        } else {
            Counters::inc(&self.inner.counters.rejected);
            warn!(
                component = COMPONENT,
                event = "rejected",
                name = %self.inner.opts.name,
                job_id = id,
                priority,
                "queue full, job rejected"
            );
            None
        }
    }

    /// Re-admits overflowed jobs until the queue fills. `None` without an overflow store
    /// or when the pass failed (the failure is logged; the next pass retries).
    pub async fn recover_overflow(&self) -> Option<RecoveryReport> {
        self.inner.recover_overflow().await
    }

    pub fn status(&self) -> QueueStatus {
        let (queued, processing, delayed) = {
            let st = self.inner.state.lock();
            (st.pending.len(), st.in_flight, st.retry.len())
        };
        let c = &self.inner.counters;
        let (overflow_persisted, overflow_recovered) = self
            .inner
            .overflow
            .as_ref()
            .map(|o| (o.persisted(), o.recovered()))
            .unwrap_or_default();

        QueueStatus {
            queued,
            processing,
            delayed,
            total: queued + processing + delayed,
            overflow_persisted,
            overflow_recovered,
            accepted: Counters::get(&c.accepted),
            completed: Counters::get(&c.completed),
            retried: Counters::get(&c.retried),
            failed: Counters::get(&c.failed),
            rejected: Counters::get(&c.rejected),
        }
    }

    /// Stops the background loops and further dispatching. Running jobs finish on their own.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl<T: Payload> Inner<T> {
    /// Fills free concurrency slots from the head of the queue.
    fn dispatch(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let (processor, jobs) = {
            let mut st = self.state.lock();
            let Some(processor) = st.processor.clone() else {
                return;
            };
            let slots = self.opts.concurrency.saturating_sub(st.in_flight);
            if slots == 0 || st.pending.is_empty() {
                return;
            }
            let jobs = st.pending.dequeue_batch(slots);
            st.in_flight += jobs.len();
            (processor, jobs)
        };

        for job in jobs {
            let inner = Arc::clone(self);
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                inner.run(job, processor).await;
            });
        }
    }

    async fn run(self: Arc<Self>, job: Job<T>, processor: ProcessorFn<T>) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        match self.invoke(&processor, job.data.clone()).await {
            Ok(()) => Counters::inc(&self.counters.completed),
            Err(err) => self.on_failure(job, err),
        }

        self.state.lock().in_flight -= 1;
        self.dispatch();
    }

    /// Runs the processor; panics and timeouts come back as errors.
    async fn invoke(&self, processor: &ProcessorFn<T>, payload: T) -> anyhow::Result<()> {
        let fut = std::panic::catch_unwind(AssertUnwindSafe(|| processor(payload)))
            .map_err(|panic| anyhow!("processor panicked: {}", panic_message(&*panic)))?;
        let fut = AssertUnwindSafe(fut).catch_unwind();

        let res = match self.opts.job_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| anyhow!("job timed out after {limit:?}"))?,
            None => fut.await,
        };

        res.unwrap_or_else(|panic| Err(anyhow!("processor panicked: {}", panic_message(&*panic))))
    }

    /// Single decision point for a failed run: park for retry or drop for good.
    fn on_failure(&self, job: Job<T>, err: anyhow::Error) {
        let job_id = job.id;
        let scheduled = self.state.lock().retry.schedule(job, Instant::now());

        match scheduled {
            Scheduled::At(due) => {
                Counters::inc(&self.counters.retried);
                warn!(
                    component = COMPONENT,
                    event = "retry_scheduled",
                    name = %self.opts.name,
                    job_id,
                    delay_ms = due.saturating_duration_since(Instant::now()).as_millis() as u64,
                    error = %err,
                    "job failed, retry scheduled"
                );
                self.retry_wake.notify_one();
            }
            Scheduled::Exhausted(job) => {
                Counters::inc(&self.counters.failed);
                error!(
                    component = COMPONENT,
                    event = "dropped",
                    name = %self.opts.name,
                    job_id,
                    retries = job.retries,
                    error = %err,
                    "job dropped after exhausting retries"
                );
            }
        }
    }

    /// Sleeps until the earliest parked job is due, re-arming whenever a new one is parked.
    async fn retry_loop(self: Arc<Self>) {
        loop {
            let next = self.state.lock().retry.next_due();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.retry_wake.notified() => continue,
                _ = sleep_until(next) => self.readmit_due().await,
            }
        }
    }

    async fn readmit_due(self: &Arc<Self>) {
        let spilled = {
            let mut st = self.state.lock();
            let due = st.retry.take_due(Instant::now());
            let mut spilled = Vec::new();
            for job in due {
                if let Err(job) = st.pending.enqueue(job) {
                    spilled.push(job);
                }
            }
            spilled
        };

        self.dispatch();

        for job in spilled {
            let persisted = match &self.overflow {
                Some(store) => store.persist(&job).await,
                None => false,
            };
            if !persisted {
                Counters::inc(&self.counters.failed);
                error!(
                    component = COMPONENT,
                    event = "dropped",
                    name = %self.opts.name,
                    job_id = job.id,
                    retries = job.retries,
                    "queue full on retry and no overflow available, job dropped"
                );
            }
        }
    }

    async fn recovery_loop(self: Arc<Self>) {
        let Some(every) = self.overflow.as_ref().map(|o| o.recover_interval()) else {
            return;
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
                _ = self.recover_now.notified() => {}
            }
            if self.state.lock().processor.is_some() {
                self.recover_overflow().await;
            }
        }
    }

    async fn recover_overflow(self: &Arc<Self>) -> Option<RecoveryReport> {
        let store = self.overflow.as_ref()?;

        let res = store
            .recover(|job| {
                let mut st = self.state.lock();
                st.next_id = st.next_id.max(job.id.saturating_add(1));
                st.pending.enqueue(job).err()
            })
            .await;

        match res {
            Ok(report) => {
                self.dispatch();
                Some(report)
            }
            Err(e) => {
                dedlog::err(COMPONENT, Some(&e as &dyn std::fmt::Display), "overflow recovery failed");
                None
            }
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
