// Periodic queue stats.

use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::job::Payload;
use super::queue::{Queue, QueueStatus};

/// Logs and exports queue status every `stats_interval` until the queue closes.
pub async fn logger<T: Payload>(queue: Queue<T>) {
    let each = queue.options().stats_interval;
    let shutdown = queue.shutdown_token().clone();
    let mut ticker = interval_at(Instant::now() + each, each);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(component = "queue", name = %queue.name(), "stats logger stopped");
                return;
            }
            _ = ticker.tick() => {
                let s = queue.status();
                export(queue.name(), &s);

                tracing::info!(
                    component = "queue",
                    event = "stats",
                    name = %queue.name(),
                    queued = s.queued,
                    processing = s.processing,
                    delayed = s.delayed,
                    accepted = s.accepted,
                    completed = s.completed,
                    retried = s.retried,
                    failed = s.failed,
                    rejected = s.rejected,
                    overflow_persisted = s.overflow_persisted,
                    overflow_recovered = s.overflow_recovered,
                    "queue stats"
                );
            }
        }
    }
}

fn export(name: &str, s: &QueueStatus) {
    let name = name.to_string();
    metrics::gauge!("streamcore_queue_queued", "queue" => name.clone()).set(s.queued as f64);
    metrics::gauge!("streamcore_queue_processing", "queue" => name.clone()).set(s.processing as f64);
    metrics::gauge!("streamcore_queue_delayed", "queue" => name.clone()).set(s.delayed as f64);
    metrics::counter!("streamcore_queue_accepted_total", "queue" => name.clone()).absolute(s.accepted);
    metrics::counter!("streamcore_queue_completed_total", "queue" => name.clone()).absolute(s.completed);
    metrics::counter!("streamcore_queue_retried_total", "queue" => name.clone()).absolute(s.retried);
    metrics::counter!("streamcore_queue_failed_total", "queue" => name.clone()).absolute(s.failed);
    metrics::counter!("streamcore_queue_rejected_total", "queue" => name.clone()).absolute(s.rejected);
    metrics::counter!("streamcore_overflow_persisted_total", "queue" => name.clone()).absolute(s.overflow_persisted);
    metrics::counter!("streamcore_overflow_recovered_total", "queue" => name).absolute(s.overflow_recovered);
}
