// Common test utilities: quick option sets and polling.

use std::path::Path;
use std::time::Duration;

use crate::cache::CacheOptions;
use crate::lockfile::LockOptions;
use crate::queue::{OverflowOptions, QueueOptions, RetryPolicy};

/// Queue options with short delays and no overflow.
pub fn queue_opts(concurrency: usize, max_queue_size: usize, max_retries: u32) -> QueueOptions {
    QueueOptions {
        name: "test-jobs".to_string(),
        concurrency,
        max_queue_size,
        retry: RetryPolicy {
            max_retries,
            delay: Duration::from_millis(20),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(1),
            priority_decrement: 1,
        },
        job_timeout: None,
        rate: None,
        overflow: None,
        stats_interval: Duration::from_secs(3600),
    }
}

/// Overflow at `<dir>/overflow/jobs.ndjson`, recovering every `every`.
pub fn overflow_opts(dir: &Path, every: Duration) -> OverflowOptions {
    let mut opts = OverflowOptions::new(dir.join("overflow").join("jobs.ndjson"));
    opts.recover_interval = every;
    opts.lock = LockOptions {
        stale_after: Duration::from_secs(60),
        max_attempts: 5,
        backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    };
    opts
}

/// Cache options with a byte budget and background work pushed out of the way.
pub fn cache_opts(budget: usize) -> CacheOptions {
    CacheOptions {
        max_memory_bytes: budget,
        sweep_interval: Duration::from_secs(3600),
        stats_interval: Duration::from_secs(3600),
        wait_attempts: 10,
        wait_interval: Duration::from_millis(20),
        ..CacheOptions::default()
    }
}

/// Polls `cond` every 5ms until it holds; false after `limit`.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
