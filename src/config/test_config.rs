use super::{Breaker, Cache, Config, CoreBox, Logs, Queue, Remote};
use std::time::Duration;

/// Creates a new test configuration.
///
/// Overflow is left unset; tests that need it point it at a temp dir.
pub fn new_test_config() -> Config {
    Config {
        core: CoreBox {
            env: super::TEST.to_string(),
            logs: Some(Logs {
                level: Some("debug".to_string()),
            }),
            queue: Some(Queue {
                name: Some("test-jobs".to_string()),
                concurrency: Some(4),
                max_retries: Some(3),
                max_queue_size: Some(1000),
                retry_delay: Some(Duration::from_millis(50)),
                backoff_factor: Some(1.0),
                max_retry_delay: Some(Duration::from_secs(5)),
                priority_decrement: Some(1),
                job_timeout: None,
                rate: None,
                stats_interval: Some(Duration::from_secs(5)),
            }),
            overflow: None,
            cache: Some(Cache {
                max_memory_mb: Some(16),
                max_entry_ratio: Some(0.25),
                default_ttl: Some(Duration::from_secs(60)),
                sweep_interval: Some(Duration::from_millis(100)),
                sweep_batch: Some(512),
                pressure_ratio: Some(0.9),
                soft_limit: Some(0.8),
                stats_interval: Some(Duration::from_secs(5)),
            }),
            remote: Some(Remote {
                lock_ttl: Some(Duration::from_secs(10)),
                wait_attempts: Some(5),
                wait_interval: Some(Duration::from_millis(20)),
            }),
            breaker: Some(Breaker {
                threshold: Some(5),
                cooldown: Some(Duration::from_secs(30)),
            }),
        },
    }
}
