//! Job and its on-disk overflow record.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Queue-assigned job identifier, monotonic per queue instance.
pub type JobId = u64;

/// Bounds a queue payload must satisfy: cloned for retries, serialized for overflow.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Unit of deferred work.
///
/// Serializes as one overflow line: `{id, data, priority, retries, createdAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job<T> {
    pub id: JobId,
    pub data: T,
    /// Higher runs sooner.
    pub priority: i32,
    pub retries: u32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl<T> Job<T> {
    pub fn new(id: JobId, data: T, priority: i32) -> Self {
        Self {
            id,
            data,
            priority,
            retries: 0,
            created_at: Utc::now(),
        }
    }
}
