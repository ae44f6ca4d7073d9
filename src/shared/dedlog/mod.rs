//! Deduplicated logging for best-effort failure paths (overflow I/O, remote tier).

pub mod log_entry;

pub use log_entry::{err, start_dedup_logger};

/// How often aggregated entries are flushed.
pub const FLUSH_EVERY: std::time::Duration = std::time::Duration::from_secs(5);
