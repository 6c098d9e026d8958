//! The persistence context shared by repositories and units of work.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use keel_cache::CacheProvider;
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::config::DataConfig;
use crate::error::DataError;
use crate::query::{DocumentQuery, Expr};
use crate::store::{Change, Document, Store, StoreTransaction};
use crate::tracker::ChangeTracker;

/// Owns a store handle, the change tracker and the optional query cache.
///
/// While a unit of work has a transaction open on the context, every read
/// and write the context makes goes through that transaction; other
/// contexts on the same store keep working outside it.
///
/// A context is meant to be driven by one logical caller at a time; it is
/// `Send + Sync` so it can be shared through an `Arc`, not so that several
/// tasks can interleave writes on it. Once [disposed](DbContext::dispose),
/// every operation fails with [`DataError::Disposed`].
pub struct DbContext<S: Store> {
    store: S,
    tracker: Mutex<ChangeTracker>,
    cache: Option<QueryCache>,
    config: DataConfig,
    disposed: AtomicBool,
    transaction: tokio::sync::Mutex<Option<S::Transaction>>,
    in_transaction: AtomicBool,
    /// Kinds written since the current transaction scope started.
    written: Mutex<HashSet<&'static str>>,
}

impl<S: Store> DbContext<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, DataConfig::default())
    }

    pub fn with_config(store: S, config: DataConfig) -> Self {
        Self {
            store,
            tracker: Mutex::new(ChangeTracker::new()),
            cache: None,
            config,
            disposed: AtomicBool::new(false),
            transaction: tokio::sync::Mutex::new(None),
            in_transaction: AtomicBool::new(false),
            written: Mutex::new(HashSet::new()),
        }
    }

    /// Attach a cache provider. Ignored when `cache.enabled` is false.
    pub fn with_cache(self, provider: Arc<dyn CacheProvider>) -> Self {
        if !self.config.cache.enabled {
            tracing::debug!("query cache disabled by configuration");
            return self;
        }
        let cache = QueryCache::from_config(provider, &self.config.cache);
        self.with_query_cache(cache)
    }

    pub fn with_query_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_ref()
    }

    /// The underlying store, bypassing the disposed check.
    pub fn raw_store(&self) -> &S {
        &self.store
    }

    /// The underlying store. Operations on it never see the work of an
    /// open transaction.
    pub fn store(&self) -> Result<&S, DataError> {
        self.ensure_active()?;
        Ok(&self.store)
    }

    /// `true` while a unit of work has a transaction open on this context.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    pub(crate) async fn attach_transaction(&self, handle: S::Transaction) {
        *self.transaction.lock().await = Some(handle);
        self.in_transaction.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn take_transaction(&self) -> Option<S::Transaction> {
        let handle = self.transaction.lock().await.take();
        self.in_transaction.store(false, Ordering::SeqCst);
        handle
    }

    pub(crate) async fn fetch(
        &self,
        kind: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<Document>, DataError> {
        self.ensure_active()?;
        let mut transaction = self.transaction.lock().await;
        match transaction.as_mut() {
            Some(handle) => handle.fetch(kind, query).await,
            None => self.store.fetch(kind, query).await,
        }
    }

    pub(crate) async fn count(&self, kind: &str, filter: Option<&Expr>) -> Result<u64, DataError> {
        self.ensure_active()?;
        let mut transaction = self.transaction.lock().await;
        match transaction.as_mut() {
            Some(handle) => handle.count(kind, filter).await,
            None => self.store.count(kind, filter).await,
        }
    }

    pub(crate) async fn find(&self, kind: &str, id: Uuid) -> Result<Option<Document>, DataError> {
        self.ensure_active()?;
        let mut transaction = self.transaction.lock().await;
        match transaction.as_mut() {
            Some(handle) => handle.find(kind, id).await,
            None => self.store.find(kind, id).await,
        }
    }

    async fn apply(&self, changes: &[Change]) -> Result<(), DataError> {
        let mut transaction = self.transaction.lock().await;
        match transaction.as_mut() {
            Some(handle) => handle.apply(changes).await,
            None => self.store.apply(changes).await,
        }
    }

    pub fn ensure_active(&self) -> Result<(), DataError> {
        if self.is_disposed() {
            return Err(DataError::Disposed);
        }
        Ok(())
    }

    pub(crate) fn tracker(&self) -> MutexGuard<'_, ChangeTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_changes(&self) -> bool {
        self.tracker().has_changes()
    }

    pub fn pending_changes(&self) -> Vec<Change> {
        self.tracker().pending().to_vec()
    }

    /// Drop pending writes but keep the snapshots of loaded entities.
    pub fn discard_changes(&self) {
        self.tracker().discard_pending();
    }

    /// Apply every pending change to the store in registration order.
    ///
    /// On success the tracker's snapshots are refreshed and cached results
    /// built from any written kind are invalidated. On failure nothing is
    /// accepted and the pending changes stay in place. Returns the number of
    /// changes written.
    pub async fn save_changes(&self) -> Result<usize, DataError> {
        self.ensure_active()?;
        let changes = self.pending_changes();
        if changes.is_empty() {
            return Ok(0);
        }

        tracing::debug!(changes = changes.len(), "saving changes");
        self.apply(&changes).await?;
        self.tracker().accept(changes.len());

        let mut kinds: Vec<&'static str> = Vec::new();
        for change in &changes {
            if !kinds.contains(&change.kind()) {
                kinds.push(change.kind());
            }
        }
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(kinds.iter().copied());
        self.invalidate(&kinds).await;

        Ok(changes.len())
    }

    async fn invalidate(&self, kinds: &[&'static str]) {
        if let Some(cache) = &self.cache {
            for kind in kinds {
                cache.invalidate_kind(kind).await;
            }
        }
    }

    /// Start tracking written kinds for a new transaction scope.
    pub(crate) fn begin_scope(&self) {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Close the scope after a commit. Results cached from a written kind
    /// while the transaction was still open are stale now.
    pub(crate) async fn end_scope(&self) {
        let kinds = self.drain_written();
        self.invalidate(&kinds).await;
    }

    /// Forget everything after a rollback: pending changes, snapshots, and
    /// any cached result built from a kind written inside the scope.
    pub(crate) async fn reset(&self) {
        self.tracker().clear();
        let kinds = self.drain_written();
        self.invalidate(&kinds).await;
    }

    fn drain_written(&self) -> Vec<&'static str> {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect()
    }

    /// Mark the context disposed and drop all tracked state, including a
    /// transaction still attached to it. Idempotent.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            tracing::debug!("context disposed");
            self.tracker().clear();
            if let Ok(mut transaction) = self.transaction.try_lock() {
                // dropping an unfinished handle rolls it back
                transaction.take();
                self.in_transaction.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl<S: Store> std::fmt::Debug for DbContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContext")
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .field("cached", &self.cache.is_some())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_disposed_context_rejects_operations() {
        let context = DbContext::new(MemoryStore::new());
        context.dispose();
        context.dispose();
        assert!(context.is_disposed());
        assert!(matches!(context.save_changes().await, Err(DataError::Disposed)));
        assert!(matches!(context.store(), Err(DataError::Disposed)));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_pending_changes() {
        let store = MemoryStore::new();
        let context = DbContext::new(store.clone());
        let id = Uuid::new_v4();
        context.tracker().track(
            "users",
            &crate::store::Document {
                id,
                version: 1,
                body: json!({"id": id, "name": "a"}).as_object().cloned().unwrap(),
            },
        );
        context
            .tracker()
            .register_update(
                "users",
                id,
                json!({"id": id, "name": "b"}).as_object().cloned().unwrap(),
                &[],
            )
            .unwrap();

        // the row was never stored, so the versioned update conflicts
        let err = context.save_changes().await.unwrap_err();
        assert!(matches!(err, DataError::Concurrency(_)));
        assert!(context.has_changes());
    }

    #[tokio::test]
    async fn test_save_with_nothing_pending_is_zero() {
        let context = DbContext::new(MemoryStore::new());
        assert_eq!(context.save_changes().await.unwrap(), 0);
    }
}
