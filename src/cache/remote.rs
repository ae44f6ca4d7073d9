//! Shared cache tier.
//!
//! The cache talks to a remote backend only through [`RemoteBackend`]. Values cross
//! the boundary as JSON bytes; every failure is absorbed by the caller and counted
//! against the circuit breaker.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::time;

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Deletes every key starting with `prefix`; returns the count.
    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<u64>;

    /// Deletes every key ending with `suffix`; returns the count.
    async fn delete_suffix(&self, suffix: &str) -> anyhow::Result<u64>;

    async fn tag_add(&self, tag: &str, key: &str) -> anyhow::Result<()>;

    async fn tag_members(&self, tag: &str) -> anyhow::Result<Vec<String>>;

    async fn tag_delete(&self, tag: &str) -> anyhow::Result<()>;

    /// Takes the lock for `key` unless someone else holds a live one.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Releases the lock only if it is still held under `token`.
    async fn unlock(&self, key: &str, token: &str) -> anyhow::Result<bool>;
}

/// In-process backend. Cache instances sharing one `Arc<MemoryBackend>` behave
/// like processes sharing a remote server.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: DashMap<String, (Vec<u8>, Instant)>,
    tags: DashMap<String, DashSet<String>>,
    locks: DashMap<String, (String, Instant)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) value count.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.values.iter().filter(|e| e.value().1 > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn delete_where(&self, pred: impl Fn(&str) -> bool) -> u64 {
        let before = self.values.len();
        self.values.retain(|k, _| !pred(k));
        (before - self.values.len()) as u64
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let hit = self.values.get(key).map(|e| (e.0.clone(), e.1));
        match hit {
            Some((value, until)) if until > now => Ok(Some(value)),
            Some(_) => {
                self.values.remove_if(key, |_, (_, until)| *until <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        self.values.insert(key.to_string(), (value, time::after(Instant::now(), ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<u64> {
        Ok(self.delete_where(|k| k.starts_with(prefix)))
    }

    async fn delete_suffix(&self, suffix: &str) -> anyhow::Result<u64> {
        Ok(self.delete_where(|k| k.ends_with(suffix)))
    }

    async fn tag_add(&self, tag: &str, key: &str) -> anyhow::Result<()> {
        self.tags.entry(tag.to_string()).or_default().insert(key.to_string());
        Ok(())
    }

    async fn tag_members(&self, tag: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .tags
            .get(tag)
            .map(|members| members.iter().map(|k| k.key().clone()).collect())
            .unwrap_or_default())
    }

    async fn tag_delete(&self, tag: &str) -> anyhow::Result<()> {
        self.tags.remove(tag);
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        let acquired = match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().1 > now {
                    false
                } else {
                    held.insert((token.to_string(), time::after(now, ttl)));
                    true
                }
            }
            Entry::Vacant(free) => {
                free.insert((token.to_string(), time::after(now, ttl)));
                true
            }
        };
        Ok(acquired)
    }

    async fn unlock(&self, key: &str, token: &str) -> anyhow::Result<bool> {
        Ok(self.locks.remove_if(key, |_, (held, _)| held == token).is_some())
    }
}
