use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::FLUSH_EVERY;

/// One aggregated failure line.
struct LogEntry {
    component: &'static str,
    reason: String,
    err: Option<String>,
    count: usize,
}

static ERR_CH: once_cell::sync::Lazy<Mutex<Option<mpsc::Sender<LogEntry>>>> =
    once_cell::sync::Lazy::new(|| Mutex::new(None));

fn err_ch() -> Option<mpsc::Sender<LogEntry>> {
    ERR_CH.try_lock().and_then(|guard| guard.clone())
}

/// Records a failure without blocking the caller.
///
/// Identical `(component, reason)` pairs are folded together and flushed once per
/// window with a count. Without a running deduplicator the failure is logged directly.
pub fn err(component: &'static str, err: Option<&dyn std::fmt::Display>, reason: &str) {
    let err = err.map(|e| e.to_string());
    match err_ch() {
        Some(tx) => {
            let _ = tx.try_send(LogEntry {
                component,
                reason: reason.to_string(),
                err,
                count: 1,
            });
        }
        None => match err {
            Some(err) => warn!(component, err = %err, "{}", reason),
            None => warn!(component, "{}", reason),
        },
    }
}

/// Runs the deduplicator until `ctx` is cancelled.
pub async fn start_dedup_logger(ctx: CancellationToken) {
    let (tx, mut rx) = mpsc::channel(1024);
    *ERR_CH.lock() = Some(tx);

    let mut cur: Arc<DashMap<(&'static str, String), LogEntry>> = Arc::new(DashMap::new());
    let mut interval = tokio::time::interval(FLUSH_EVERY);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                flush(&cur);
                break;
            }
            entry = rx.recv() => {
                let Some(entry) = entry else { break };
                let key = (entry.component, entry.reason.clone());
                if let Some(mut existing) = cur.get_mut(&key) {
                    existing.count += 1;
                    if entry.err.is_some() {
                        existing.err = entry.err;
                    }
                } else {
                    cur.insert(key, entry);
                }
            }
            _ = interval.tick() => {
                let prev = std::mem::replace(&mut cur, Arc::new(DashMap::new()));
                flush(&prev);
            }
        }
    }

    *ERR_CH.lock() = None;
}

fn flush(entries: &DashMap<(&'static str, String), LogEntry>) {
    for entry in entries.iter() {
        match &entry.err {
            Some(err) => error!(
                component = entry.component,
                count = entry.count,
                err = %err,
                "{}", entry.reason
            ),
            None => error!(component = entry.component, count = entry.count, "{}", entry.reason),
        }
    }
}
