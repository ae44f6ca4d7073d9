//! Adaptive cache: byte-budgeted LRU with TTL, tags and pattern deletes, plus an
//! optional remote tier guarded by a circuit breaker.

pub mod breaker;
pub mod cache;
pub mod error;
pub mod index;
pub mod lru;
pub mod remote;
pub mod size;
pub mod stampede;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod index_test;
#[cfg(test)]
mod size_test;
#[cfg(test)]
mod store_test;

pub use breaker::{BreakerOptions, BreakerState, CircuitBreaker};
pub use cache::{Cache, CacheOptions, CacheStats, CacheValue, SweepReport};
pub use error::CacheError;
pub use remote::{MemoryBackend, RemoteBackend};
pub use size::Weigh;
