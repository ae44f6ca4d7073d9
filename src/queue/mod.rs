//! Resilient in-process job queue.

pub mod counters;
pub mod job;
pub mod overflow;
pub mod priority;
pub mod queue;
pub mod retry;
pub mod telemetry;


pub use job::{Job, JobId, Payload};
pub use overflow::{OverflowError, OverflowOptions, OverflowStore, OverflowSummary, RecoveryReport};
pub use queue::{Queue, QueueOptions, QueueStatus};
pub use retry::RetryPolicy;
