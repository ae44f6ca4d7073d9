// Background expiry sweep, pressure eviction and cache stats.

use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::cache::{Cache, CacheStats, CacheValue};

/// Runs until the cache is closed.
pub async fn run<V: CacheValue>(cache: Cache<V>) {
    let opts = cache.options().clone();
    let shutdown = cache.shutdown_token().clone();

    let mut sweep = interval_at(Instant::now() + opts.sweep_interval, opts.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = interval_at(Instant::now() + opts.stats_interval, opts.stats_interval);
    stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(component = "cache", "sweeper stopped");
                return;
            }
            _ = sweep.tick() => {
                let report = cache.sweep();
                if report.expired > 0 || report.evicted > 0 {
                    tracing::debug!(
                        component = "cache",
                        event = "swept",
                        expired = report.expired,
                        evicted = report.evicted,
                        "cache sweep"
                    );
                }
            }
            _ = stats.tick() => {
                let s = cache.get_stats();
                export(&s);
                tracing::info!(
                    component = "cache",
                    event = "stats",
                    items = s.item_count,
                    memory_usage = s.memory_usage,
                    memory_budget = s.memory_budget,
                    hits = s.hits,
                    misses = s.misses,
                    hit_rate = s.hit_rate,
                    evictions = s.evictions,
                    expirations = s.expirations,
                    rejections = s.rejections,
                    remote_errors = s.remote_errors,
                    pending = s.pending_requests,
                    breaker = %s.breaker,
                    "cache stats"
                );
            }
        }
    }
}

fn export(s: &CacheStats) {
    metrics::gauge!("streamcore_cache_items").set(s.item_count as f64);
    metrics::gauge!("streamcore_cache_memory_bytes").set(s.memory_usage as f64);
    metrics::gauge!("streamcore_cache_hit_rate").set(s.hit_rate);
    metrics::gauge!("streamcore_cache_pending_requests").set(s.pending_requests as f64);
    metrics::counter!("streamcore_cache_hits_total").absolute(s.hits);
    metrics::counter!("streamcore_cache_misses_total").absolute(s.misses);
    metrics::counter!("streamcore_cache_evictions_total").absolute(s.evictions);
    metrics::counter!("streamcore_cache_expirations_total").absolute(s.expirations);
    metrics::counter!("streamcore_cache_rejections_total").absolute(s.rejections);
    metrics::counter!("streamcore_cache_remote_errors_total").absolute(s.remote_errors);
}
