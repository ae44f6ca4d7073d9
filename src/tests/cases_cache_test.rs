//! Cache scenarios: TTL, coalescing, tags, patterns, budget, remote tier, breaker.

use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::{BreakerState, Cache, CacheError, MemoryBackend, RemoteBackend};
use crate::support::{cache_opts, FlakyBackend};

fn local(budget: usize) -> Cache {
    Cache::new(CancellationToken::new(), cache_opts(budget))
}

fn text(len: usize) -> Value {
    Value::String("x".repeat(len))
}

async fn exploding_factory() -> anyhow::Result<Value> {
    panic!("factory bug")
}

#[tokio::test(start_paused = true)]
async fn test_ttl_boundary() {
    let cache = local(1 << 20);
    assert!(cache.set("k", json!("v"), Some(Duration::from_secs(1))).await);
    assert_eq!(cache.get("k").await.as_deref(), Some(&json!("v")));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(cache.get("k").await.is_none(), "expired entry must never be returned");

    let stats = cache.get_stats();
    assert_eq!(stats.item_count, 0, "expired entry is deleted on read");
    assert_eq!(stats.expirations, 1);
    assert_eq!((stats.hits, stats.misses), (1, 1));
}

#[tokio::test]
async fn test_hundred_concurrent_callers_share_one_factory_run() {
    let cache = local(1 << 20);
    let calls = Arc::new(AtomicU32::new(0));

    let callers = (0..100).map(|_| {
        let cache = cache.clone();
        let calls = calls.clone();
        async move {
            cache
                .get_or_set("hot", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({ "viewers": 42 }))
                })
                .await
        }
    });
    let results = join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for res in results {
        assert_eq!(*res.unwrap(), json!({ "viewers": 42 }));
    }
    assert_eq!(cache.get_stats().pending_requests, 0);
}

#[tokio::test]
async fn test_factory_error_reaches_caller_and_is_not_cached() {
    let cache = local(1 << 20);

    let err = cache
        .get_or_set("k", None, || async { anyhow::bail!("upstream 503") })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Factory(_)));
    assert!(err.to_string().contains("upstream 503"));
    assert_eq!(cache.get_stats().pending_requests, 0);

    let v = cache.get_or_set("k", None, || async { Ok(json!(1)) }).await.unwrap();
    assert_eq!(*v, json!(1));
}

#[tokio::test]
async fn test_factory_panic_becomes_error() {
    let cache = local(1 << 20);
    let err = cache
        .get_or_set("k", None, exploding_factory)
        .await
        .unwrap_err();
    match err {
        CacheError::FactoryPanicked(msg) => assert_eq!(msg, "factory bug"),
        other => panic!("expected panic error, got {other:?}"),
    }
    assert!(cache.get("k").await.is_none());
}

#[tokio::test]
async fn test_invalidate_tag_removes_every_member() {
    let cache = local(1 << 20);
    for key in ["stream:1:chat", "stream:1:revenue", "stream:1:viewers"] {
        assert!(cache.set_with_tags(key, json!(key), None, &["T"]).await);
    }
    cache.set_with_tags("stream:2:chat", json!(0), None, &["other"]).await;
    assert_eq!(cache.tag_members("T"), 3);

    assert_eq!(cache.invalidate_tag("T").await, 3);
    for key in ["stream:1:chat", "stream:1:revenue", "stream:1:viewers"] {
        assert!(cache.get(key).await.is_none());
    }
    assert_eq!(cache.tag_members("T"), 0);
    assert!(cache.get("stream:2:chat").await.is_some());
}

#[tokio::test]
async fn test_pattern_deletes() {
    let cache = local(1 << 20);
    for key in ["user:1:profile", "user:1:stats", "user:2:stats", "users", "stream:9:stats"] {
        cache.set(key, json!(1), None).await;
    }

    assert_eq!(cache.delete_pattern("user:1:").await, 2);
    assert_eq!(cache.delete_suffix(":stats").await, 2);
    assert!(cache.get("users").await.is_some());
    assert!(cache.delete("users").await);
    assert!(!cache.delete("users").await);
    assert_eq!(cache.get_stats().item_count, 0);
}

#[tokio::test]
async fn test_lru_eviction_keeps_recently_used() {
    // Each entry weighs 96 + 2 + 124 = 222 bytes, so nine fit in 2000.
    let mut opts = cache_opts(2000);
    opts.max_entry_ratio = 0.5;
    let cache: Cache = Cache::new(CancellationToken::new(), opts);

    for i in 0..9 {
        assert!(cache.set(&format!("k{i}"), text(100), None).await);
    }
    assert_eq!(cache.get_stats().item_count, 9);
    assert!(cache.get("k0").await.is_some());

    cache.set("k9", text(100), None).await;
    let stats = cache.get_stats();
    assert_eq!(stats.evictions, 1);
    assert!(stats.memory_usage <= 2000);
    assert!(cache.get("k0").await.is_some(), "recently read entry survives");
    assert!(cache.get("k1").await.is_none(), "least recently used entry is evicted");
}

#[tokio::test]
async fn test_oversized_value_is_rejected() {
    let cache = local(2000);
    assert!(!cache.set("big", text(1000), None).await);
    assert!(cache.get("big").await.is_none());
    assert_eq!(cache.get_stats().rejections, 1);

    // The factory result is still returned, just not cached.
    let v = cache.get_or_set("big", None, || async { Ok(text(1000)) }).await.unwrap();
    assert_eq!(v.as_str().map(str::len), Some(1000));
    assert_eq!(cache.get_stats().item_count, 0);
}

#[tokio::test]
async fn test_sweep_relieves_memory_pressure() {
    let mut opts = cache_opts(10_000);
    opts.soft_limit = 0.5;
    let cache: Cache = Cache::new(CancellationToken::new(), opts);

    // 223 bytes each; 44 entries put usage above the 90% pressure mark.
    for i in 0..44 {
        cache.set(&format!("p{i:02}"), text(100), None).await;
    }
    assert!(cache.get_stats().memory_usage >= 9000);

    let report = cache.sweep();
    assert_eq!(report.evicted, 22);
    assert!(cache.get_stats().memory_usage <= 5000);
    assert_eq!(cache.sweep().evicted, 0);
}

#[tokio::test]
async fn test_remote_tier_fills_second_cache() {
    let shared = Arc::new(MemoryBackend::new());
    let a: Cache = Cache::with_remote(CancellationToken::new(), cache_opts(1 << 20), shared.clone());
    let b: Cache = Cache::with_remote(CancellationToken::new(), cache_opts(1 << 20), shared.clone());

    a.set_with_tags("streamer:7:revenue", json!(12.5), None, &["streamer:7"]).await;
    assert_eq!(b.get("streamer:7:revenue").await.as_deref(), Some(&json!(12.5)));
    assert_eq!(b.get_stats().item_count, 1, "remote hit is stored locally");

    b.invalidate_tag("streamer:7").await;
    assert!(shared.get("streamer:7:revenue").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stampede_guard_spans_caches_sharing_a_backend() {
    let shared = Arc::new(MemoryBackend::new());
    let a: Cache = Cache::with_remote(CancellationToken::new(), cache_opts(1 << 20), shared.clone());
    let b: Cache = Cache::with_remote(CancellationToken::new(), cache_opts(1 << 20), shared.clone());
    let calls = Arc::new(AtomicU32::new(0));

    let run = |cache: Cache, calls: Arc<AtomicU32>| async move {
        cache
            .get_or_set("leaderboard", None, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(json!(["a", "b"]))
            })
            .await
    };

    let (ra, rb) = tokio::join!(run(a, calls.clone()), run(b, calls.clone()));
    assert_eq!(*ra.unwrap(), json!(["a", "b"]));
    assert_eq!(*rb.unwrap(), json!(["a", "b"]));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "lock loser must wait for the winner's value");
}

#[tokio::test]
async fn test_breaker_opens_and_cache_falls_back_to_local() {
    let remote = Arc::new(FlakyBackend::failing());
    let mut opts = cache_opts(1 << 20);
    opts.breaker.threshold = 2;
    let cache: Cache = Cache::with_remote(CancellationToken::new(), opts, remote.clone());

    let v = cache.get_or_set("k", None, || async { Ok(json!("local")) }).await.unwrap();
    assert_eq!(*v, json!("local"));

    let stats = cache.get_stats();
    assert_eq!(stats.breaker, BreakerState::Open);
    assert_eq!(stats.remote_errors, 2);
    let calls = remote.calls();

    assert!(cache.set("other", json!(1), None).await);
    assert!(cache.get("missing").await.is_none());
    assert_eq!(remote.calls(), calls, "open breaker must skip remote calls");
    assert_eq!(cache.get("k").await.as_deref(), Some(&json!("local")));
}

#[tokio::test]
async fn test_unbounded_ttl_never_expires() {
    let shared = Arc::new(MemoryBackend::new());
    let cache: Cache = Cache::with_remote(CancellationToken::new(), cache_opts(1 << 20), shared.clone());

    assert!(cache.set("forever", json!(1), Some(Duration::MAX)).await);
    assert!(cache.set("also-forever", json!(2), Some(Duration::from_secs(u64::MAX))).await);
    let v = cache
        .get_or_set("computed", Some(Duration::MAX), || async { Ok(json!(3)) })
        .await
        .unwrap();
    assert_eq!(*v, json!(3));

    assert_eq!(cache.get("forever").await.as_deref(), Some(&json!(1)));
    assert_eq!(cache.get_stats().item_count, 3);
    assert!(shared.get("also-forever").await.unwrap().is_some());
}

#[tokio::test]
async fn test_dead_lock_holder_falls_back_to_local_compute() {
    let shared = Arc::new(MemoryBackend::new());
    assert!(shared.try_lock("k", "dead-holder", Duration::from_secs(3600)).await.unwrap());
    let cache: Cache = Cache::with_remote(CancellationToken::new(), cache_opts(1 << 20), shared.clone());

    let v = cache.get_or_set("k", None, || async { Ok(json!("local")) }).await.unwrap();
    assert_eq!(*v, json!("local"));
    assert_eq!(cache.get("k").await.as_deref(), Some(&json!("local")));

    // The stuck holder's lock is left alone.
    assert!(!shared.try_lock("k", "someone-else", Duration::from_secs(1)).await.unwrap());
}

#[tokio::test]
async fn test_unlock_requires_matching_token() {
    let backend = MemoryBackend::new();
    assert!(backend.try_lock("k", "owner", Duration::from_secs(60)).await.unwrap());

    assert!(!backend.unlock("k", "someone-else").await.unwrap());
    assert!(!backend.try_lock("k", "someone-else", Duration::from_secs(60)).await.unwrap());

    assert!(backend.unlock("k", "owner").await.unwrap());
    assert!(backend.try_lock("k", "someone-else", Duration::from_secs(60)).await.unwrap());
}
