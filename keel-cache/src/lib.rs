//! # keel-cache — cache provider capability for keel
//!
//! The data layer never talks to a cache backend directly. It goes through
//! [`CacheProvider`], a byte-oriented key/value contract with per-entry
//! expiration. Serialization of cached values is the caller's business.
//!
//! [`InMemoryCacheProvider`] is the default backend. Swap it for Redis,
//! Memcached or anything else by implementing the trait.

mod error;
mod memory;

pub use error::CacheError;
pub use memory::InMemoryCacheProvider;

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by [`CacheProvider`] methods.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Pluggable cache backend.
///
/// Every method is fallible so that callers can decide how to degrade when
/// the backend is unreachable. The keel data layer treats any error as a
/// cache miss and falls through to the store.
pub trait CacheProvider: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Bytes>>;
    fn set<'a>(&'a self, key: &'a str, value: Bytes, expiration: Duration) -> CacheFuture<'a, ()>;
    fn remove<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()>;
    fn remove_by_prefix<'a>(&'a self, prefix: &'a str) -> CacheFuture<'a, ()>;
    fn clear(&self) -> CacheFuture<'_, ()>;
}

pub mod prelude {
    //! Re-exports of the most commonly used cache types.
    pub use crate::{CacheError, CacheProvider, InMemoryCacheProvider};
}
