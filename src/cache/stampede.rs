//! In-process request coalescing: one computation per key, any number of waiters.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::safe::panic_message;

use super::error::CacheError;

type Computation<V> = Shared<BoxFuture<'static, Result<Arc<V>, CacheError>>>;

/// Joins concurrent callers for the same key onto a single shared future.
///
/// The computation unregisters itself when it completes, whichever waiter drives
/// it, so a cancelled first caller never leaves a stale result behind.
pub struct Coalescer<V> {
    pending: Arc<Mutex<HashMap<String, Computation<V>>>>,
}

impl<V: Send + Sync + 'static> Coalescer<V> {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `compute` unless a computation for `key` is already in flight, in which
    /// case its result is awaited instead. Panics inside `compute` become errors.
    pub async fn run<F>(&self, key: &str, compute: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Arc<V>, CacheError>>,
    {
        let shared = {
            let mut pending = self.pending.lock();
            match pending.get(key) {
                Some(inflight) => inflight.clone(),
                None => {
                    let registry = Arc::clone(&self.pending);
                    let owned_key = key.to_string();
                    let fut = AssertUnwindSafe(compute()).catch_unwind();
                    let computation = async move {
                        let res = fut.await.unwrap_or_else(|panic| {
                            Err(CacheError::FactoryPanicked(panic_message(&*panic)))
                        });
                        registry.lock().remove(&owned_key);
                        res
                    }
                    .boxed()
                    .shared();
                    pending.insert(key.to_string(), computation.clone());
                    computation
                }
            }
        };
        shared.await
    }

    /// Keys with a computation in flight.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<V: Send + Sync + 'static> Default for Coalescer<V> {
    fn default() -> Self {
        Self::new()
    }
}
