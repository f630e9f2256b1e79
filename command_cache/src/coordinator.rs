//! Request coalescing: at most one execution per key, results cached forever.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::ResolveError,
    key::CommandKey,
    registry::LockRegistry,
    store::Store,
};

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub result: String,
    /// `true` when the result came from the store without executing.
    pub cached: bool,
}

/// Arbitrates concurrent callers so each key is computed once.
pub struct Coordinator {
    store: Arc<dyn Store>,
    locks: LockRegistry,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: LockRegistry::new(),
        }
    }

    /// Return the stored result for `key`, computing and storing it first if
    /// there is none.
    ///
    /// Concurrent callers for the same key wait for the first one and then
    /// read its stored result. Callers for different keys never wait on each
    /// other here. A failed `compute` is not cached.
    #[instrument(skip(self, compute), fields(key = %key))]
    pub async fn resolve<F, Fut>(&self, key: &CommandKey, compute: F) -> Result<Resolved, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
    {
        let _guard = self.locks.acquire(key.as_str()).await;

        if let Some(result) = self.store.get(key.as_str()).await {
            debug!("Cache hit");
            return Ok(Resolved {
                result,
                cached: true,
            });
        }

        let result = compute().await.map_err(|e| {
            warn!("Execution failed: {:#}", e);
            ResolveError::Execution(e)
        })?;

        self.store
            .set(key.as_str(), result.clone())
            .await
            .map_err(|e| {
                warn!("Failed to persist result: {}", e);
                ResolveError::Persistence(e)
            })?;

        info!("Stored new result");
        Ok(Resolved {
            result,
            cached: false,
        })
    }

    /// Keys currently being resolved or waited on.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }

    pub async fn cached_entries(&self) -> usize {
        self.store.len().await
    }
}
