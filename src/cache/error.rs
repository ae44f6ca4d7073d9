use std::sync::Arc;

/// Failure returned by `get_or_set`. Cloned to every coalesced waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("value factory failed: {0:#}")]
    Factory(Arc<anyhow::Error>),
    #[error("value factory panicked: {0}")]
    FactoryPanicked(String),
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Factory(Arc::new(err))
    }
}
