//! Adaptive cache facade: local LRU tier, optional remote tier behind a circuit
//! breaker, and stampede-protected `get_or_set`.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigTrait};
use crate::dedlog;
use crate::safe;
use crate::time::{self, Clock};

use super::breaker::{BreakerOptions, BreakerState, CircuitBreaker, Permit};
use super::error::CacheError;
use super::remote::RemoteBackend;
use super::size::{self, Weigh};
use super::stampede::Coalescer;
use super::store::{Insert, Lookup, Store};
use super::sweeper;

const COMPONENT: &str = "cache";
const REMOTE_COMPONENT: &str = "cache.remote";

/// Bounds a cached value must satisfy: weighed for the budget, JSON for the remote tier.
pub trait CacheValue: Weigh + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Weigh + Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub max_memory_bytes: usize,
    /// Largest single entry as a share of the budget.
    pub max_entry_ratio: f64,
    /// TTL when a call passes none, and for values pulled from the remote tier.
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
    /// Expired entries removed per sweep at most.
    pub sweep_batch: usize,
    /// Usage share that triggers background eviction.
    pub pressure_ratio: f64,
    /// Usage share background eviction brings the cache down to.
    pub soft_limit: f64,
    pub stats_interval: Duration,
    pub lock_ttl: Duration,
    pub wait_attempts: u32,
    pub wait_interval: Duration,
    pub breaker: BreakerOptions,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 << 20,
            max_entry_ratio: 0.25,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            sweep_batch: 1000,
            pressure_ratio: 0.9,
            soft_limit: 0.8,
            stats_interval: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(10),
            wait_attempts: 10,
            wait_interval: Duration::from_millis(100),
            breaker: BreakerOptions::default(),
        }
    }
}

impl CacheOptions {
    /// Builds options from the `cache`, `remote` and `breaker` config sections.
    pub fn from_config(cfg: &Config) -> Self {
        let mut opts = Self::default();
        if let Some(c) = cfg.cache() {
            if let Some(mb) = c.max_memory_mb {
                opts.max_memory_bytes = mb << 20;
            }
            opts.max_entry_ratio = c.max_entry_ratio.unwrap_or(opts.max_entry_ratio);
            opts.default_ttl = c.default_ttl.unwrap_or(opts.default_ttl);
            opts.sweep_interval = c.sweep_interval.unwrap_or(opts.sweep_interval);
            opts.sweep_batch = c.sweep_batch.unwrap_or(opts.sweep_batch);
            opts.pressure_ratio = c.pressure_ratio.unwrap_or(opts.pressure_ratio);
            opts.soft_limit = c.soft_limit.unwrap_or(opts.soft_limit);
            opts.stats_interval = c.stats_interval.unwrap_or(opts.stats_interval);
        }
        if let Some(r) = cfg.remote() {
            opts.lock_ttl = r.lock_ttl.unwrap_or(opts.lock_ttl);
            opts.wait_attempts = r.wait_attempts.unwrap_or(opts.wait_attempts);
            opts.wait_interval = r.wait_interval.unwrap_or(opts.wait_interval);
        }
        opts.breaker = BreakerOptions::from_config(cfg);
        opts
    }

    fn share(&self, ratio: f64) -> usize {
        (self.max_memory_bytes as f64 * ratio) as usize
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    rejections: AtomicU64,
    remote_errors: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Snapshot returned by [`Cache::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub item_count: usize,
    pub memory_usage: usize,
    pub memory_budget: usize,
    pub hit_rate: f64,
    pub pending_requests: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub rejections: u64,
    pub remote_errors: u64,
    pub breaker: BreakerState,
}

/// Result of one background sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

struct Inner<V> {
    opts: CacheOptions,
    store: Mutex<Store<V>>,
    clock: Arc<dyn Clock>,
    remote: Option<Arc<dyn RemoteBackend>>,
    breaker: CircuitBreaker,
    coalescer: Coalescer<V>,
    counters: Counters,
    shutdown: CancellationToken,
}

/// Handle to a cache. Clones share the same cache.
pub struct Cache<V = serde_json::Value> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> Cache<V> {
    /// Local-only cache on the process clock.
    pub fn new(shutdown: CancellationToken, opts: CacheOptions) -> Self {
        Self::build(shutdown, opts, None, time::system())
    }

    /// Cache mirrored to `remote`.
    pub fn with_remote(shutdown: CancellationToken, opts: CacheOptions, remote: Arc<dyn RemoteBackend>) -> Self {
        Self::build(shutdown, opts, Some(remote), time::system())
    }

    /// Creates the cache and starts its sweeper.
    pub fn build(
        shutdown: CancellationToken,
        opts: CacheOptions,
        remote: Option<Arc<dyn RemoteBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Store::new(opts.max_memory_bytes, opts.share(opts.max_entry_ratio));
        let breaker = CircuitBreaker::new(opts.breaker.clone(), Arc::clone(&clock));

        let cache = Self {
            inner: Arc::new(Inner {
                store: Mutex::new(store),
                clock,
                remote,
                breaker,
                coalescer: Coalescer::new(),
                counters: Counters::default(),
                shutdown: shutdown.child_token(),
                opts,
            }),
        };

        let swept = cache.clone();
        tokio::spawn(async move {
            sweeper::run(swept).await;
        });

        info!(
            component = COMPONENT,
            event = "created",
            budget_bytes = cache.inner.opts.max_memory_bytes,
            remote = cache.inner.remote.is_some(),
            "cache created"
        );
        cache
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.opts
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Returns a live value, consulting the remote tier on a local miss.
    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        let c = &self.inner.counters;
        if let Some(v) = self.inner.get_local(key) {
            bump(&c.hits, 1);
            return Some(v);
        }
        if let Some(v) = self.inner.remote_fetch(key).await {
            self.inner.store_local(key, Arc::clone(&v), self.inner.opts.default_ttl, Vec::new());
            bump(&c.hits, 1);
            return Some(v);
        }
        bump(&c.misses, 1);
        None
    }

    /// Stores `value` for `ttl` (default TTL when `None`). `false` when the value
    /// is too large to cache.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> bool {
        self.set_with_tags(key, value, ttl, &[]).await
    }

    pub async fn set_with_tags(&self, key: &str, value: V, ttl: Option<Duration>, tags: &[&str]) -> bool {
        let ttl = ttl.unwrap_or(self.inner.opts.default_ttl);
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        let value = Arc::new(value);

        if !self.inner.store_local(key, Arc::clone(&value), ttl, tags.clone()) {
            return false;
        }
        self.inner.publish(key, &value, ttl, &tags).await;
        true
    }

    /// Deletes `key` from both tiers. Reports whether it was held locally.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.inner.store.lock().remove(key);
        if let Some((remote, permit)) = self.inner.remote_permit() {
            let res = remote.delete(key).await;
            self.inner.settle(permit, "delete", res);
        }
        removed
    }

    /// Deletes every key starting with `prefix`; returns the local count.
    pub async fn delete_pattern(&self, prefix: &str) -> usize {
        let removed = self.inner.store.lock().remove_prefix(prefix);
        if let Some((remote, permit)) = self.inner.remote_permit() {
            let res = remote.delete_prefix(prefix).await;
            self.inner.settle(permit, "delete_prefix", res);
        }
        debug!(component = COMPONENT, event = "delete_pattern", prefix, removed, "prefix deleted");
        removed
    }

    /// Deletes every key ending with `suffix`; returns the local count.
    pub async fn delete_suffix(&self, suffix: &str) -> usize {
        let removed = self.inner.store.lock().remove_suffix(suffix);
        if let Some((remote, permit)) = self.inner.remote_permit() {
            let res = remote.delete_suffix(suffix).await;
            self.inner.settle(permit, "delete_suffix", res);
        }
        debug!(component = COMPONENT, event = "delete_suffix", suffix, removed, "suffix deleted");
        removed
    }

    /// Deletes every key under `tag` on both tiers and drops the tag.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        let removed = self.inner.store.lock().remove_tag(tag);

        let members = match self.inner.remote_permit() {
            Some((remote, permit)) => {
                let res = remote.tag_members(tag).await;
                self.inner.settle(permit, "tag_members", res)
            }
            None => None,
        };
        if let Some(members) = members {
            for key in &members {
                let Some((remote, permit)) = self.inner.remote_permit() else {
                    break;
                };
                let res = remote.delete(key).await;
                self.inner.settle(permit, "delete", res);
            }
            if let Some((remote, permit)) = self.inner.remote_permit() {
                let res = remote.tag_delete(tag).await;
                self.inner.settle(permit, "tag_delete", res);
            }
        }

        info!(component = COMPONENT, event = "tag_invalidated", tag, removed, "tag invalidated");
        removed
    }

    /// Returns the cached value or computes it with `factory`.
    ///
    /// Concurrent calls for one key share a single computation in this process.
    /// With a remote tier, the computation first reads the shared value, then
    /// races for the key's remote lock; losers poll for the winner's value a
    /// bounded number of times before computing locally. Factory errors and
    /// panics are returned to every waiter and nothing is cached.
    pub async fn get_or_set<F, Fut>(&self, key: &str, ttl: Option<Duration>, factory: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.get_or_set_with_tags(key, ttl, &[], factory).await
    }

    pub async fn get_or_set_with_tags<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tags: &[&str],
        factory: F,
    ) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if let Some(v) = self.inner.get_local(key) {
            bump(&self.inner.counters.hits, 1);
            return Ok(v);
        }
        bump(&self.inner.counters.misses, 1);

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let ttl = ttl.unwrap_or(self.inner.opts.default_ttl);
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();

        self.inner
            .coalescer
            .run(key, move || inner.compute(owned_key, ttl, tags, factory).boxed())
            .await
    }

    /// Removes expired entries (bounded by `sweep_batch`) and, above the pressure
    /// ratio, evicts down to the soft limit.
    pub fn sweep(&self) -> SweepReport {
        let opts = &self.inner.opts;
        let now = self.inner.clock.now();

        let report = {
            let mut store = self.inner.store.lock();
            let expired = store.sweep_expired(now, opts.sweep_batch.max(1));
            let evicted = if store.mem() >= opts.share(opts.pressure_ratio) {
                store.evict_to(opts.share(opts.soft_limit))
            } else {
                0
            };
            SweepReport { expired, evicted }
        };

        let c = &self.inner.counters;
        bump(&c.expirations, report.expired as u64);
        bump(&c.evictions, report.evicted as u64);
        report
    }

    pub fn get_stats(&self) -> CacheStats {
        let (item_count, memory_usage, memory_budget) = {
            let store = self.inner.store.lock();
            (store.len(), store.mem(), store.budget())
        };
        let c = &self.inner.counters;
        let (hits, misses) = (read(&c.hits), read(&c.misses));

        CacheStats {
            hits,
            misses,
            item_count,
            memory_usage,
            memory_budget,
            hit_rate: safe::divide(hits, hits + misses),
            pending_requests: self.inner.coalescer.pending(),
            evictions: read(&c.evictions),
            expirations: read(&c.expirations),
            rejections: read(&c.rejections),
            remote_errors: read(&c.remote_errors),
            breaker: self.inner.breaker.state(),
        }
    }

    /// Live members of `tag` in the local tier.
    pub fn tag_members(&self, tag: &str) -> usize {
        self.inner.store.lock().tag_members(tag)
    }

    /// Drops every local entry and index. The remote tier is left alone.
    pub fn clear(&self) {
        self.inner.store.lock().clear();
        info!(component = COMPONENT, event = "cleared", "local cache cleared");
    }

    /// Stops the sweeper. The cache stays usable.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl<V: CacheValue> Inner<V> {
    fn get_local(&self, key: &str) -> Option<Arc<V>> {
        let lookup = self.store.lock().get(key, self.clock.now());
        match lookup {
            Lookup::Hit(v) => Some(v),
            Lookup::Expired => {
                bump(&self.counters.expirations, 1);
                None
            }
            Lookup::Miss => None,
        }
    }

    fn store_local(&self, key: &str, value: Arc<V>, ttl: Duration, tags: Vec<String>) -> bool {
        let size = size::entry_size(key, value.as_ref());
        let expires_at = time::after(self.clock.now(), ttl);
        let outcome = self.store.lock().insert(key.to_string(), value, size, expires_at, tags);

        match outcome {
            Insert::Stored { evicted } => {
                bump(&self.counters.evictions, evicted as u64);
                true
            }
            Insert::Rejected => {
                bump(&self.counters.rejections, 1);
                warn!(
                    component = COMPONENT,
                    event = "rejected",
                    key,
                    size,
                    max_entry = self.opts.share(self.opts.max_entry_ratio),
                    "value exceeds per-entry limit, not cached"
                );
                false
            }
        }
    }

    async fn compute<F, Fut>(
        self: Arc<Self>,
        key: String,
        ttl: Duration,
        tags: Vec<String>,
        factory: F,
    ) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        // Filled by a computation that finished between our miss and now.
        if let Some(v) = self.get_local(&key) {
            return Ok(v);
        }

        if self.remote.is_some() {
            if let Some(v) = self.remote_fetch(&key).await {
                self.store_local(&key, Arc::clone(&v), ttl, tags);
                return Ok(v);
            }

            let token = lock_token();
            match self.remote_lock(&key, &token).await {
                Some(true) => {
                    let res = self.produce(&key, ttl, &tags, factory).await;
                    self.remote_unlock(&key, &token).await;
                    return res;
                }
                Some(false) => {
                    for _ in 0..self.opts.wait_attempts {
                        tokio::time::sleep(self.opts.wait_interval).await;
                        if let Some(v) = self.remote_fetch(&key).await {
                            self.store_local(&key, Arc::clone(&v), ttl, tags.clone());
                            return Ok(v);
                        }
                    }
                    debug!(
                        component = COMPONENT,
                        event = "lock_wait_exhausted",
                        key = %key,
                        attempts = self.opts.wait_attempts,
                        "remote lock holder did not publish, computing locally"
                    );
                }
                None => {}
            }
        }

        self.produce(&key, ttl, &tags, factory).await
    }

    async fn produce<F, Fut>(&self, key: &str, ttl: Duration, tags: &[String], factory: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let value = Arc::new(factory().await?);
        if self.store_local(key, Arc::clone(&value), ttl, tags.to_vec()) {
            self.publish(key, &value, ttl, tags).await;
        }
        Ok(value)
    }

    /// Mirrors a stored value and its tags to the remote tier.
    async fn publish(&self, key: &str, value: &V, ttl: Duration, tags: &[String]) {
        if self.remote.is_none() {
            return;
        }
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                dedlog::err(REMOTE_COMPONENT, Some(&e as &dyn std::fmt::Display), "encode value for remote tier");
                return;
            }
        };

        let Some((remote, permit)) = self.remote_permit() else {
            return;
        };
        let res = remote.set(key, bytes, ttl).await;
        if self.settle(permit, "set", res).is_none() {
            return;
        }

        for tag in tags {
            let Some((remote, permit)) = self.remote_permit() else {
                return;
            };
            let res = remote.tag_add(tag, key).await;
            self.settle(permit, "tag_add", res);
        }
    }

    async fn remote_fetch(&self, key: &str) -> Option<Arc<V>> {
        let (remote, permit) = self.remote_permit()?;
        let res = remote.get(key).await;
        let bytes = self.settle(permit, "get", res)??;
        match serde_json::from_slice::<V>(&bytes) {
            Ok(v) => Some(Arc::new(v)),
            Err(e) => {
                dedlog::err(REMOTE_COMPONENT, Some(&e as &dyn std::fmt::Display), "undecodable remote value");
                None
            }
        }
    }

    async fn remote_lock(&self, key: &str, token: &str) -> Option<bool> {
        let (remote, permit) = self.remote_permit()?;
        let res = remote.try_lock(key, token, self.opts.lock_ttl).await;
        self.settle(permit, "try_lock", res)
    }

    async fn remote_unlock(&self, key: &str, token: &str) {
        let Some((remote, permit)) = self.remote_permit() else {
            return;
        };
        let res = remote.unlock(key, token).await;
        if self.settle(permit, "unlock", res) == Some(false) {
            debug!(component = COMPONENT, event = "lock_lost", key, "remote lock expired before release");
        }
    }

    /// A remote backend and the breaker's leave to call it.
    fn remote_permit(&self) -> Option<(&dyn RemoteBackend, Permit<'_>)> {
        let remote = self.remote.as_deref()?;
        let permit = self.breaker.try_acquire()?;
        Some((remote, permit))
    }

    /// Feeds the outcome to the breaker; failures are logged and become `None`.
    fn settle<R>(&self, permit: Permit<'_>, op: &'static str, res: anyhow::Result<R>) -> Option<R> {
        match res {
            Ok(r) => {
                permit.succeed();
                Some(r)
            }
            Err(e) => {
                permit.fail();
                bump(&self.counters.remote_errors, 1);
                dedlog::err(REMOTE_COMPONENT, Some(&e as &dyn std::fmt::Display), &format!("remote {op} failed"));
                None
            }
        }
    }
}

fn lock_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
