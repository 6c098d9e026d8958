//! # keel-data — data access core
//!
//! Entities are persisted as versioned JSON documents behind the [`Store`]
//! capability. On top of it sit:
//!
//! - [`Specification`]: a filter tree, ordering chain and include tree,
//!   built without touching the store,
//! - [`Repository`]: typed reads, change-tracked writes and paging,
//! - [`UnitOfWork`]: one store transaction across several repositories,
//!   with lifecycle [events](TransactionEvents),
//! - [`QueryCache`]: optional read-through caching keyed by
//!   [`CacheKeyGenerator`].
//!
//! [`MemoryStore`] is the in-process backend; `keel-data-sqlx` provides a
//! SQLite one.

pub mod cache;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod events;
pub mod include;
pub mod memory;
pub mod page;
pub mod query;
pub mod repository;
pub mod save_result;
pub mod specification;
pub mod store;
pub mod tracker;
pub mod unit_of_work;

pub use cache::{CacheKeyGenerator, QueryCache};
pub use config::{CacheConfig, ConfigError, DataConfig, PagingConfig};
pub use context::DbContext;
pub use entity::{Entity, Reference};
pub use error::DataError;
pub use events::{SubscriptionId, TransactionEvent, TransactionEventKind, TransactionEvents};
pub use include::{IncludePath, IncludeTree, Navigation, Relation};
pub use memory::{MemoryStore, MemoryTransaction};
pub use page::{PageRequest, PagedResult};
pub use query::{Body, CompareOp, Condition, Direction, DocumentQuery, Expr, Field, Filter, SortKey};
pub use repository::Repository;
pub use save_result::SaveResult;
pub use specification::Specification;
pub use store::{Change, Document, Store, StoreTransaction};
pub use unit_of_work::UnitOfWork;

pub mod prelude {
    //! Re-exports of the most commonly used data types.
    pub use crate::{
        DataError, DbContext, Entity, Field, Filter, MemoryStore, Navigation, PagedResult,
        Reference, Repository, SaveResult, Specification, Store, UnitOfWork,
    };
}
