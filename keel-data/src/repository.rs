use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::context::DbContext;
use crate::entity::{to_body, Entity};
use crate::error::DataError;
use crate::include::{resolve_includes, IncludeTree};
use crate::page::{PageRequest, PagedResult};
use crate::query::{Body, DocumentQuery, Filter};
use crate::save_result::SaveResult;
use crate::specification::Specification;
use crate::store::Store;

/// Generic repository over one entity type.
///
/// Reads go to the store (or to the context's open transaction) and register
/// snapshots in the context's change tracker. Writes (`add`, `update`, `delete`) are only recorded;
/// [`save`](Repository::save) applies them. Repositories created from the
/// same context share its tracker, so they take part in the same unit of
/// work.
///
/// # Example
///
/// ```ignore
/// let context = DbContext::new(MemoryStore::new()).into_shared();
/// let users = Repository::<User, _>::new(context);
///
/// users.add(user.clone())?;
/// assert!(users.save().await?.succeeded());
///
/// let mut spec = users.create_specification();
/// spec.and(User::NAME.like("a%"));
/// let page = users.get_paged(&spec, 1, 20).await?;
/// ```
pub struct Repository<T, S: Store> {
    context: Arc<DbContext<S>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S: Store> Clone for Repository<T, S> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Entity, S: Store> Repository<T, S> {
    pub fn new(context: Arc<DbContext<S>>) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    pub fn context(&self) -> &Arc<DbContext<S>> {
        &self.context
    }

    pub fn create_specification(&self) -> Specification<T> {
        Specification::new()
    }

    fn query_for(spec: &Specification<T>) -> DocumentQuery {
        DocumentQuery::new()
            .filter(spec.filter_expr())
            .order(spec.ordering().to_vec())
    }

    /// Fetch, track, resolve includes, then deserialize.
    async fn load(&self, query: DocumentQuery, includes: &IncludeTree) -> Result<Vec<T>, DataError> {
        let kind = T::table_name();
        let filter = query
            .filter
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        tracing::debug!(kind, %filter, limit = ?query.limit, "executing query");
        let docs = self.context.fetch(kind, &query).await?;
        tracing::debug!(kind, rows = docs.len(), "query returned");

        let mut bodies: Vec<Body> = {
            let mut tracker = self.context.tracker();
            docs.into_iter()
                .map(|doc| {
                    tracker.track(kind, &doc);
                    doc.body
                })
                .collect()
        };
        resolve_includes(&self.context, includes, &mut bodies).await?;
        bodies.into_iter().map(from_body).collect()
    }

    /// The single entity matching `spec`, with includes loaded. Ordering is
    /// ignored. More than one match is an error.
    pub async fn get(&self, spec: &Specification<T>) -> Result<Option<T>, DataError> {
        let query = DocumentQuery::new().filter(spec.filter_expr()).limit(2);
        let mut found = self.load(query, spec.includes()).await?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            _ => Err(DataError::MultipleResults {
                entity: T::entity_name(),
            }),
        }
    }

    pub async fn list(&self, spec: &Specification<T>) -> Result<Vec<T>, DataError> {
        self.load(Self::query_for(spec), spec.includes()).await
    }

    /// `None` asks whether any row exists at all.
    pub async fn exists(&self, predicate: Option<Filter<T>>) -> Result<bool, DataError> {
        let query = DocumentQuery::new()
            .filter(predicate.map(Filter::into_expr))
            .limit(1);
        let rows = self.context.fetch(T::table_name(), &query).await?;
        Ok(!rows.is_empty())
    }

    pub async fn count(&self, predicate: Option<Filter<T>>) -> Result<u64, DataError> {
        let expr = predicate.map(Filter::into_expr);
        self.context.count(T::table_name(), expr.as_ref()).await
    }

    pub async fn get_all(&self) -> Result<Vec<T>, DataError> {
        self.load(DocumentQuery::new(), &IncludeTree::new()).await
    }

    /// Unsaved writes of this context win over the store: a pending insert
    /// or update comes back the way it will be saved, and an entity marked
    /// for deletion is `None`.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<T>, DataError> {
        self.context.ensure_active()?;
        let kind = T::table_name();
        {
            let tracker = self.context.tracker();
            if let Some(body) = tracker.pending_insert(kind, id) {
                return from_body(body.clone()).map(Some);
            }
            if let Some(body) = tracker.pending_update(kind, id) {
                return from_body(body).map(Some);
            }
            if tracker.is_pending_delete(kind, id) {
                return Ok(None);
            }
        }
        let Some(doc) = self.context.find(kind, id).await? else {
            return Ok(None);
        };
        self.context.tracker().track(kind, &doc);
        from_body(doc.body).map(Some)
    }

    /// Register `entity` for insertion on the next save.
    pub fn add(&self, entity: T) -> Result<T, DataError> {
        self.context.ensure_active()?;
        let body = to_body(&entity)?;
        self.context
            .tracker()
            .register_insert(T::table_name(), entity.id(), body, T::references())?;
        Ok(entity)
    }

    /// Diff `entity` against its tracked snapshot and record the changed
    /// fields. An entity that was never read through this context is loaded
    /// first. Returns the names of the changed fields.
    pub async fn update(&self, entity: &T) -> Result<Vec<String>, DataError> {
        let kind = T::table_name();
        let id = entity.id();
        self.ensure_loaded(id).await?;
        let body = to_body(entity)?;
        let dirty = self
            .context
            .tracker()
            .register_update(kind, id, body, T::references())?;
        tracing::debug!(kind, %id, fields = ?dirty, "update registered");
        Ok(dirty)
    }

    /// Mark the entity with `id` for removal on the next save.
    pub async fn delete(&self, id: Uuid) -> Result<(), DataError> {
        self.ensure_loaded(id).await?;
        self.context.tracker().register_delete(T::table_name(), id)
    }

    async fn ensure_loaded(&self, id: Uuid) -> Result<(), DataError> {
        self.context.ensure_active()?;
        let kind = T::table_name();
        let known = {
            let tracker = self.context.tracker();
            tracker.is_tracked(kind, id) || tracker.pending_insert(kind, id).is_some()
        };
        if known {
            return Ok(());
        }
        match self.context.find(kind, id).await? {
            Some(doc) => {
                self.context.tracker().track(kind, &doc);
                Ok(())
            }
            None => Err(DataError::NotFound(format!(
                "{} with id {id}",
                T::entity_name()
            ))),
        }
    }

    /// Apply every pending change of the shared context.
    ///
    /// Persistence failures come back as [`SaveResult::Failed`]; misuse
    /// (for instance a disposed context) is still an error.
    pub async fn save(&self) -> Result<SaveResult, DataError> {
        match self.context.save_changes().await {
            Ok(_) => Ok(SaveResult::Succeeded),
            Err(err) if err.is_programmer_error() => Err(err),
            Err(DataError::Concurrency(msg)) => {
                tracing::warn!(kind = T::table_name(), %msg, "save failed on a concurrency conflict");
                Ok(SaveResult::failed([format!(
                    "Concurrency conflict detected. {msg}"
                )]))
            }
            Err(err) => {
                tracing::warn!(kind = T::table_name(), error = %err, "save failed");
                Ok(SaveResult::failed([format!(
                    "An unexpected error occurred: {err}"
                )]))
            }
        }
    }

    /// One page of the entities matching `spec`. The total is counted over
    /// the same filter before the page is sliced.
    pub async fn get_paged(
        &self,
        spec: &Specification<T>,
        page_number: u64,
        page_size: u64,
    ) -> Result<PagedResult<T>, DataError> {
        let request = PageRequest::new(page_number, page_size)?;
        let max = self.context.config().paging.max_page_size;
        if page_size > max {
            return Err(DataError::InvalidArgument(format!(
                "page_size must be <= {max}, got {page_size}"
            )));
        }

        let filter = spec.filter_expr();
        let total = self.context.count(T::table_name(), filter.as_ref()).await?;
        let query = Self::query_for(spec)
            .offset(request.offset())
            .limit(request.page_size);
        let items = self.load(query, spec.includes()).await?;
        Ok(PagedResult::new(items, total, request))
    }

    /// [`get_paged`](Repository::get_paged) with the configured default page
    /// size.
    pub async fn get_page(
        &self,
        spec: &Specification<T>,
        page_number: u64,
    ) -> Result<PagedResult<T>, DataError> {
        let size = self.context.config().paging.default_page_size;
        self.get_paged(spec, page_number, size).await
    }

    /// The query cache, unless there is none or a transaction is open:
    /// uncommitted rows must not reach a cache other contexts read from.
    fn shared_cache(&self) -> Option<&QueryCache> {
        if self.context.in_transaction() {
            return None;
        }
        self.context.cache()
    }

    fn cache_tags(spec: &Specification<T>) -> Vec<&'static str> {
        let mut tags = vec![T::table_name()];
        for kind in spec.includes().kinds() {
            if !tags.contains(&kind) {
                tags.push(kind);
            }
        }
        tags
    }

    /// Cache-augmented [`get`](Repository::get). Without a configured cache,
    /// or inside a transaction, this is a plain `get`. Entities served from the cache are not tracked
    /// until they are updated or deleted.
    pub async fn get_cached(
        &self,
        spec: &Specification<T>,
        expiration: Duration,
    ) -> Result<Option<T>, DataError> {
        self.context.ensure_active()?;
        let Some(cache) = self.shared_cache() else {
            return self.get(spec).await;
        };
        let key = format!("{}_Single", cache.key_generator().generate_key(spec, 0, 0));
        if let Some(hit) = cache.get::<Option<T>>(&key).await {
            return Ok(hit);
        }
        let value = self.get(spec).await?;
        cache
            .put(
                &key,
                &value,
                expiration,
                &cache.key_generator().entity_prefix::<T>(),
                &Self::cache_tags(spec),
            )
            .await;
        Ok(value)
    }

    pub async fn list_cached(
        &self,
        spec: &Specification<T>,
        expiration: Duration,
    ) -> Result<Vec<T>, DataError> {
        self.context.ensure_active()?;
        let Some(cache) = self.shared_cache() else {
            return self.list(spec).await;
        };
        let key = cache.key_generator().generate_key(spec, 0, 0);
        if let Some(hit) = cache.get::<Vec<T>>(&key).await {
            return Ok(hit);
        }
        let value = self.list(spec).await?;
        cache
            .put(
                &key,
                &value,
                expiration,
                &cache.key_generator().entity_prefix::<T>(),
                &Self::cache_tags(spec),
            )
            .await;
        Ok(value)
    }

    pub async fn get_paged_cached(
        &self,
        spec: &Specification<T>,
        page_number: u64,
        page_size: u64,
        expiration: Duration,
    ) -> Result<PagedResult<T>, DataError> {
        self.context.ensure_active()?;
        let Some(cache) = self.shared_cache() else {
            return self.get_paged(spec, page_number, page_size).await;
        };
        let key = cache
            .key_generator()
            .generate_key(spec, page_number, page_size);
        if let Some(hit) = cache.get::<PagedResult<T>>(&key).await {
            return Ok(hit);
        }
        let value = self.get_paged(spec, page_number, page_size).await?;
        cache
            .put(
                &key,
                &value,
                expiration,
                &cache.key_generator().entity_prefix::<T>(),
                &Self::cache_tags(spec),
            )
            .await;
        Ok(value)
    }
}

fn from_body<T: Entity>(body: Body) -> Result<T, DataError> {
    Ok(serde_json::from_value(Value::Object(body))?)
}
