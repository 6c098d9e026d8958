//! Cache key generation and the read-through query cache.

use bytes::Bytes;
use keel_cache::CacheProvider;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::entity::Entity;
use crate::specification::Specification;

/// Maps a specification plus paging parameters to a deterministic key.
///
/// The key is built from, in order: the prefix, the entity name, the filter's
/// textual form, the ordering keys, the dotted include paths, and the page
/// number/size when both are positive. Two specifications built by the same
/// sequence of calls produce the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKeyGenerator {
    prefix: String,
}

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The prefix shared by every key generated for `T`.
    pub fn entity_prefix<T: Entity>(&self) -> String {
        format!("{}{}", self.prefix, T::entity_name())
    }

    pub fn generate_key<T: Entity>(
        &self,
        spec: &Specification<T>,
        page_number: u64,
        page_size: u64,
    ) -> String {
        let mut key = self.entity_prefix::<T>();

        if let Some(filter) = spec.filter() {
            key.push_str(&format!("_Filter_{filter}"));
        }

        if spec.has_ordering() {
            let keys: Vec<String> = spec.ordering().iter().map(|k| k.to_string()).collect();
            key.push_str(&format!("_OrderBy_{}", keys.join(",")));
        }

        if !spec.includes().is_empty() {
            key.push_str(&format!("_Includes_{}", spec.includes().paths().join(",")));
        }

        if page_number > 0 && page_size > 0 {
            key.push_str(&format!("_Page_{page_number}_Size_{page_size}"));
        }

        key
    }
}

/// Read-through cache for query results.
///
/// Values are stored as JSON. Invalidation state lives in the provider
/// itself, so every context sharing a provider sees the same state: for each
/// document kind a tag entry lists the entity key prefixes whose cached
/// results were built from that kind (the primary kind and every included
/// kind). [`invalidate_kind`](QueryCache::invalidate_kind) removes every key
/// under those prefixes with [`CacheProvider::remove_by_prefix`].
///
/// Provider failures never fail a read: they are logged and treated as a
/// miss.
#[derive(Clone)]
pub struct QueryCache {
    provider: Arc<dyn CacheProvider>,
    keys: CacheKeyGenerator,
    default_expiration: Duration,
}

/// Tag entries outlive the results they describe.
const MIN_TAG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

impl QueryCache {
    pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
        Self::from_config(provider, &CacheConfig::default())
    }

    pub fn from_config(provider: Arc<dyn CacheProvider>, config: &CacheConfig) -> Self {
        Self {
            provider,
            keys: CacheKeyGenerator::with_prefix(config.key_prefix.clone()),
            default_expiration: config.default_ttl(),
        }
    }

    pub fn key_generator(&self) -> &CacheKeyGenerator {
        &self.keys
    }

    pub fn default_expiration(&self) -> Duration {
        self.default_expiration
    }

    pub fn provider(&self) -> &Arc<dyn CacheProvider> {
        &self.provider
    }

    fn tag_key(&self, kind: &str) -> String {
        format!("{}__keel_tags__{kind}", self.keys.prefix())
    }

    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        let bytes = match self.provider.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!(key, "cache miss");
                return None;
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "cache get failed, falling back to store");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                tracing::debug!(key, "cache hit");
                Some(value)
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Store `value` under `key` and register `entity_prefix` (see
    /// [`CacheKeyGenerator::entity_prefix`]) as depending on each of `kinds`.
    pub async fn put<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        expiration: Duration,
        entity_prefix: &str,
        kinds: &[&'static str],
    ) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                tracing::warn!(key, error = %err, "cannot serialize value for cache");
                return;
            }
        };
        // register first: a result must never be visible without its tags
        for kind in kinds {
            if !self.register(kind, entity_prefix, expiration).await {
                return;
            }
        }
        if let Err(err) = self.provider.set(key, bytes, expiration).await {
            tracing::warn!(key, error = %err, "cache set failed");
        }
    }

    /// Add `entity_prefix` to the tag entry of `kind`. Re-written on every
    /// put, so an entry lost to a concurrent registration comes back with the
    /// next put for that entity.
    async fn register(&self, kind: &str, entity_prefix: &str, expiration: Duration) -> bool {
        let tag_key = self.tag_key(kind);
        let mut prefixes = self.tagged(&tag_key).await.unwrap_or_default();
        if !prefixes.iter().any(|p| p == entity_prefix) {
            prefixes.push(entity_prefix.to_string());
        }
        let bytes = match serde_json::to_vec(&prefixes) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                tracing::warn!(kind, error = %err, "cannot serialize cache tags");
                return false;
            }
        };
        match self
            .provider
            .set(&tag_key, bytes, expiration.max(MIN_TAG_TTL))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(kind, error = %err, "cache tag update failed, result not cached");
                false
            }
        }
    }

    async fn tagged(&self, tag_key: &str) -> Option<Vec<String>> {
        match self.provider.get(tag_key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key = tag_key, error = %err, "cache tag read failed");
                None
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        if let Err(err) = self.provider.remove(key).await {
            tracing::warn!(key, error = %err, "cache remove failed");
        }
    }

    /// Drop every entry this cache owns: whatever lives under its key prefix,
    /// or the whole provider when the prefix is empty.
    pub async fn clear(&self) {
        let prefix = self.keys.prefix();
        let result = if prefix.is_empty() {
            self.provider.clear().await
        } else {
            self.provider.remove_by_prefix(prefix).await
        };
        match result {
            Ok(()) => tracing::debug!(prefix, "query cache cleared"),
            Err(err) => tracing::warn!(prefix, error = %err, "cache clear failed"),
        }
    }

    /// Remove every cached result that was built from documents of `kind`,
    /// whichever context cached it.
    pub async fn invalidate_kind(&self, kind: &str) {
        let Some(prefixes) = self.tagged(&self.tag_key(kind)).await else {
            return;
        };
        tracing::debug!(kind, entities = prefixes.len(), "invalidating cached queries");
        for prefix in prefixes {
            if let Err(err) = self.provider.remove_by_prefix(&prefix).await {
                tracing::warn!(kind, prefix, error = %err, "cache invalidation failed");
            }
        }
    }
}
