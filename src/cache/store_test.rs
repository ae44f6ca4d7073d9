//! Tests for the byte-budgeted store.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::store::{Insert, Lookup, Store};

fn put(s: &mut Store<u32>, key: &str, size: usize, expires_at: Instant) -> Insert {
    s.insert(key.to_string(), Arc::new(size as u32), size, expires_at, Vec::new())
}

fn is_hit(l: Lookup<u32>) -> bool {
    matches!(l, Lookup::Hit(_))
}

#[test]
fn test_evicts_lru_tail_until_new_entry_fits() {
    let now = Instant::now();
    let later = now + Duration::from_secs(60);
    let mut s = Store::new(1000, 400);

    put(&mut s, "a", 300, later);
    put(&mut s, "b", 300, later);
    put(&mut s, "c", 300, later);
    assert!(is_hit(s.get("a", now)), "a becomes most recently used");

    assert_eq!(put(&mut s, "d", 300, later), Insert::Stored { evicted: 1 });
    assert!(!s.contains("b"), "b was the LRU tail");
    assert!(s.contains("a") && s.contains("c") && s.contains("d"));
    assert_eq!(s.mem(), 900);
}

#[test]
fn test_rejects_oversized_entry_without_side_effects() {
    let now = Instant::now();
    let mut s = Store::new(1000, 250);
    put(&mut s, "keep", 200, now + Duration::from_secs(1));

    assert_eq!(put(&mut s, "keep", 251, now + Duration::from_secs(1)), Insert::Rejected);
    assert_eq!(s.mem(), 200, "rejected overwrite keeps the old value");
    assert!(s.contains("keep"));
}

#[test]
fn test_overwrite_replaces_size_and_tags() {
    let now = Instant::now();
    let later = now + Duration::from_secs(60);
    let mut s = Store::new(1000, 1000);

    s.insert("k".into(), Arc::new(1), 100, later, vec!["t1".into()]);
    s.insert("k".into(), Arc::new(2), 50, later, vec!["t2".into()]);

    assert_eq!(s.mem(), 50);
    assert_eq!(s.len(), 1);
    assert_eq!(s.tag_members("t1"), 0);
    assert_eq!(s.tag_members("t2"), 1);
    match s.get("k", now) {
        Lookup::Hit(v) => assert_eq!(*v, 2),
        other => panic!("expected hit, got {other:?}"),
    }
}

#[test]
fn test_expired_entry_is_deleted_on_read() {
    let now = Instant::now();
    let mut s = Store::new(1000, 1000);
    put(&mut s, "k", 10, now + Duration::from_secs(1));

    assert!(is_hit(s.get("k", now + Duration::from_millis(999))));
    assert!(matches!(s.get("k", now + Duration::from_secs(1)), Lookup::Expired));
    assert!(matches!(s.get("k", now), Lookup::Miss));
    assert_eq!(s.mem(), 0);
}

#[test]
fn test_sweep_is_bounded_and_oldest_first() {
    let now = Instant::now();
    let mut s = Store::new(10_000, 1000);
    for i in 0..10u64 {
        put(&mut s, &format!("k{i}"), 10, now + Duration::from_millis(i));
    }
    put(&mut s, "live", 10, now + Duration::from_secs(60));

    let at = now + Duration::from_secs(1);
    assert_eq!(s.sweep_expired(at, 4), 4);
    assert!(!s.contains("k0") && !s.contains("k3"));
    assert!(s.contains("k4"));
    assert_eq!(s.sweep_expired(at, 100), 6);
    assert_eq!(s.len(), 1);
    assert!(s.contains("live"));
}

#[test]
fn test_pattern_and_tag_removal() {
    let now = Instant::now();
    let later = now + Duration::from_secs(60);
    let mut s = Store::new(10_000, 1000);
    for key in ["user:1:stats", "user:2:stats", "stream:1:stats", "user:1:profile"] {
        s.insert(key.into(), Arc::new(0), 10, later, vec!["all".into()]);
    }

    assert_eq!(s.remove_prefix("user:1"), 2);
    assert_eq!(s.remove_suffix(":stats"), 2);
    assert!(s.is_empty());
    assert_eq!(s.tag_count(), 0, "removing keys must empty their tags");

    for key in ["a", "b"] {
        s.insert(key.into(), Arc::new(0), 10, later, vec!["t".into()]);
    }
    assert_eq!(s.remove_tag("t"), 2);
    assert_eq!(s.mem(), 0);
}

#[test]
fn test_evict_to_target() {
    let now = Instant::now();
    let later = now + Duration::from_secs(60);
    let mut s = Store::new(1000, 1000);
    for i in 0..10 {
        put(&mut s, &format!("k{i}"), 100, later);
    }
    assert_eq!(s.evict_to(800), 2);
    assert!(!s.contains("k0") && !s.contains("k1"));
    assert_eq!(s.evict_to(10_000), 0);

    s.clear();
    assert_eq!((s.len(), s.mem()), (0, 0));
}
