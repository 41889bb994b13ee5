use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::key::KeyError;
use crate::store::StoreError;

/// Boxed error type accepted from upstream query executors.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by the query cache.
///
/// Cloneable so that one outcome can be handed to every caller waiting on the same
/// fetch.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("entry of size {size} exceeds cache capacity {capacity}")]
    EntryTooLarge { size: u64, capacity: u64 },

    #[error(transparent)]
    Upstream(UpstreamError),

    #[error("gave up waiting for result after {0:?}")]
    Timeout(Duration),

    #[error("request cannot be cached: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("upstream fetch ended without producing a result")]
    FetchAborted,
}

impl CacheError {
    /// Wraps an upstream executor error.
    pub fn upstream(err: impl Into<BoxError>) -> Self {
        Self::Upstream(UpstreamError(Arc::from(err.into())))
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EntryTooLarge { size, capacity } => Self::EntryTooLarge { size, capacity },
        }
    }
}

/// The executor's own error, shared between every waiter of a failed fetch.
#[derive(Clone)]
pub struct UpstreamError(Arc<dyn StdError + Send + Sync + 'static>);

impl UpstreamError {
    /// Returns the original error if it is of type `E`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for UpstreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}
