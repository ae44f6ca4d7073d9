use std::time::Duration;

use super::{AdvisoryLock, LockOptions};

fn quick_opts() -> LockOptions {
    LockOptions {
        stale_after: Duration::from_secs(120),
        max_attempts: 3,
        backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

#[tokio::test]
async fn test_acquire_creates_and_release_removes_marker() {
    let dir = tempfile::tempdir().unwrap();
    let lock = AdvisoryLock::beside(&dir.path().join("jobs.ndjson"), quick_opts());
    assert!(lock.path().ends_with("jobs.ndjson.lock"));

    let guard = lock.acquire().await.expect("free lock must be acquired");
    assert!(lock.path().exists());
    assert_eq!(std::fs::metadata(lock.path()).unwrap().len(), 0);

    guard.release().await;
    assert!(!lock.path().exists());
}

#[tokio::test]
async fn test_held_lock_is_not_acquired_twice() {
    let dir = tempfile::tempdir().unwrap();
    let lock = AdvisoryLock::beside(&dir.path().join("q"), quick_opts());

    let first = lock.acquire().await.unwrap();
    assert!(lock.acquire().await.is_none());

    first.release().await;
    assert!(lock.acquire().await.is_some());
}

#[tokio::test]
async fn test_stale_marker_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = quick_opts();
    opts.stale_after = Duration::ZERO;
    let lock = AdvisoryLock::beside(&dir.path().join("q"), opts);

    std::fs::write(lock.path(), b"").unwrap();
    let guard = lock.acquire().await;
    assert!(guard.is_some(), "abandoned marker must not block forever");
}

#[tokio::test]
async fn test_release_does_not_remove_foreign_marker() {
    let dir = tempfile::tempdir().unwrap();
    let lock = AdvisoryLock::beside(&dir.path().join("q"), quick_opts());

    let guard = lock.acquire().await.unwrap();
    // Another process reclaimed the lock and created its own marker.
    std::fs::remove_file(lock.path()).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    std::fs::write(lock.path(), b"").unwrap();
    let later = std::time::SystemTime::now() + Duration::from_secs(5);
    std::fs::File::options()
        .write(true)
        .open(lock.path())
        .unwrap()
        .set_modified(later)
        .unwrap();

    guard.release().await;
    assert!(lock.path().exists());
}

#[tokio::test]
async fn test_dropped_guard_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let lock = AdvisoryLock::beside(&dir.path().join("q"), quick_opts());
    {
        let _guard = lock.acquire().await.unwrap();
    }
    assert!(!lock.path().exists());
}
