// Remote backend that can be switched into failure mode.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::{MemoryBackend, RemoteBackend};

/// `MemoryBackend` with a failure switch and a call counter.
#[derive(Debug, Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl FlakyBackend {
    pub fn failing() -> Self {
        let b = Self::default();
        b.set_failing(true);
        b
    }

    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("remote unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for FlakyBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<u64> {
        self.check()?;
        self.inner.delete_prefix(prefix).await
    }

    async fn delete_suffix(&self, suffix: &str) -> anyhow::Result<u64> {
        self.check()?;
        self.inner.delete_suffix(suffix).await
    }

    async fn tag_add(&self, tag: &str, key: &str) -> anyhow::Result<()> {
        self.check()?;
        self.inner.tag_add(tag, key).await
    }

    async fn tag_members(&self, tag: &str) -> anyhow::Result<Vec<String>> {
        self.check()?;
        self.inner.tag_members(tag).await
    }

    async fn tag_delete(&self, tag: &str) -> anyhow::Result<()> {
        self.check()?;
        self.inner.tag_delete(tag).await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.check()?;
        self.inner.try_lock(key, token, ttl).await
    }

    async fn unlock(&self, key: &str, token: &str) -> anyhow::Result<bool> {
        self.check()?;
        self.inner.unlock(key, token).await
    }
}
