use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use super::{Config, ConfigTrait};

const FULL: &str = r#"
streamcore:
  env: prod
  logs:
    level: info
  queue:
    name: chat-ingest
    concurrency: 8
    max_retries: 5
    max_queue_size: 20000
    retry_delay: 2s
    backoff_factor: 2.0
    max_retry_delay: 1m
    priority_decrement: 1
    job_timeout: 30s
    rate: 200
  overflow:
    enabled: true
    path: /var/lib/streamcore/overflow.ndjson
    recover_interval: 30s
    lock_stale_after: 2m
  cache:
    max_memory_mb: 256
    default_ttl: 5m
    sweep_interval: 1s
  breaker:
    threshold: 5
    cooldown: 30s
"#;

#[test]
fn test_parses_humantime_durations_and_sections() {
    let cfg = Config::from_yaml(FULL).expect("valid config");
    assert!(cfg.is_prod());

    let queue = cfg.queue().unwrap();
    assert_eq!(queue.concurrency, Some(8));
    assert_eq!(queue.retry_delay, Some(Duration::from_secs(2)));
    assert_eq!(queue.max_retry_delay, Some(Duration::from_secs(60)));
    assert_eq!(queue.stats_interval, None);

    let overflow = cfg.overflow().unwrap();
    assert!(overflow.enabled);
    assert_eq!(overflow.lock_stale_after, Some(Duration::from_secs(120)));
    assert_eq!(overflow.lock_attempts, None);

    assert_eq!(cfg.cache().unwrap().max_memory_mb, Some(256));
    assert!(cfg.remote().is_none());
    assert_eq!(cfg.breaker().unwrap().cooldown, Some(Duration::from_secs(30)));
}

#[test]
fn test_minimal_config_is_accepted() {
    let cfg = Config::from_yaml("streamcore:\n  env: dev\n").unwrap();
    assert!(!cfg.is_prod());
    assert!(cfg.queue().is_none());
}

#[test]
fn test_rejects_zero_concurrency() {
    let yaml = "streamcore:\n  env: dev\n  queue:\n    concurrency: 0\n";
    let err = Config::from_yaml(yaml).unwrap_err();
    assert!(format!("{err:#}").contains("queue.concurrency"));
}

#[test]
fn test_rejects_out_of_range_ratio() {
    let yaml = "streamcore:\n  env: dev\n  cache:\n    pressure_ratio: 1.5\n";
    let err = Config::from_yaml(yaml).unwrap_err();
    assert!(format!("{err:#}").contains("pressure_ratio"));
}

#[test]
fn test_enabled_overflow_needs_a_path() {
    let yaml = "streamcore:\n  env: dev\n  overflow:\n    enabled: true\n";
    assert_err!(Config::from_yaml(yaml));
}

#[test]
fn test_config_is_valid() {
    let cfg = super::new_test_config();
    assert!(cfg.is_test());
    assert_ok!(cfg.validate());
}
