use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{CacheFuture, CacheProvider};

/// Default in-memory cache provider backed by `DashMap`.
///
/// Each entry stores `(value, inserted_at, expiration)` and is lazily evicted
/// on access. Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct InMemoryCacheProvider {
    inner: Arc<DashMap<String, (Bytes, Instant, Duration)>>,
}

impl InMemoryCacheProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Remove all expired entries.
    pub fn evict_expired(&self) {
        self.inner
            .retain(|_, (_, inserted, expiration)| inserted.elapsed() < *expiration);
    }
}

impl CacheProvider for InMemoryCacheProvider {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            if let Some(entry) = self.inner.get(key) {
                let (val, inserted, expiration) = entry.value();
                if inserted.elapsed() < *expiration {
                    return Ok(Some(val.clone()));
                }
                // Expired: drop the read guard before removing
                drop(entry);
                self.inner.remove(key);
                tracing::trace!(key, "evicted expired cache entry");
            }
            Ok(None)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes, expiration: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.inner
                .insert(key.to_string(), (value, Instant::now(), expiration));
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.inner.remove(key);
            Ok(())
        })
    }

    fn remove_by_prefix<'a>(&'a self, prefix: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.inner.retain(|k, _| !k.starts_with(prefix));
            Ok(())
        })
    }

    fn clear(&self) -> CacheFuture<'_, ()> {
        Box::pin(async move {
            self.inner.clear();
            Ok(())
        })
    }
}
