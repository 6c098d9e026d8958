//! The persistence capability the data layer is written against.
//!
//! Backends persist versioned JSON documents grouped by kind (the entity's
//! table name). They execute [`DocumentQuery`]s, apply ordered change sets
//! atomically, and hand out transaction handles. Query translation, storage
//! and connection management all stay behind this trait.

use std::future::Future;
use uuid::Uuid;

use crate::entity::Reference;
use crate::error::DataError;
use crate::query::{Body, DocumentQuery, Expr};

/// A stored document. `version` starts at 1 on insert and is incremented by
/// one on every update; it doubles as the optimistic concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub version: u64,
    pub body: Body,
}

/// One pending write.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert {
        kind: &'static str,
        id: Uuid,
        body: Body,
        references: &'static [Reference],
    },
    /// Overwrite only `fields`, provided the stored version still equals
    /// `expected_version`.
    Update {
        kind: &'static str,
        id: Uuid,
        expected_version: u64,
        fields: Body,
        references: &'static [Reference],
    },
    Delete {
        kind: &'static str,
        id: Uuid,
        expected_version: u64,
    },
}

impl Change {
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Insert { kind, .. } | Change::Update { kind, .. } | Change::Delete { kind, .. } => {
                *kind
            }
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Change::Insert { id, .. } | Change::Update { id, .. } | Change::Delete { id, .. } => *id,
        }
    }
}

/// Document store backend.
///
/// Uses RPITIT (return-position `impl Trait` in traits), no `async-trait`
/// needed. Implementors can write plain `async fn`s.
///
/// `apply` is all-or-nothing and must report stale versions or vanished
/// rows as [`DataError::Concurrency`] and referential or uniqueness
/// violations as [`DataError::Constraint`]. Operations called on the store
/// itself never see uncommitted work of an open transaction, and a
/// transaction's rollback never undoes writes made outside it.
pub trait Store: Send + Sync + 'static {
    type Transaction: StoreTransaction;

    fn fetch(
        &self,
        kind: &str,
        query: &DocumentQuery,
    ) -> impl Future<Output = Result<Vec<Document>, DataError>> + Send;

    fn count(
        &self,
        kind: &str,
        filter: Option<&Expr>,
    ) -> impl Future<Output = Result<u64, DataError>> + Send;

    fn find(
        &self,
        kind: &str,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Document>, DataError>> + Send;

    fn apply(&self, changes: &[Change]) -> impl Future<Output = Result<(), DataError>> + Send;

    /// Open a transaction owned by the returned handle. Reads and writes
    /// issued through the handle see its own uncommitted work.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, DataError>> + Send;
}

/// Handle to an open backend transaction.
///
/// The same operations as [`Store`], scoped to this transaction. Each
/// `apply` is all-or-nothing within the transaction. Dropping a handle that
/// was neither committed nor rolled back rolls the transaction back.
/// Rolling back after a failed commit is allowed and is a no-op when there
/// is nothing left to undo. Operations on a finished handle fail with
/// [`DataError::InvalidState`].
pub trait StoreTransaction: Send + 'static {
    fn fetch(
        &mut self,
        kind: &str,
        query: &DocumentQuery,
    ) -> impl Future<Output = Result<Vec<Document>, DataError>> + Send;

    fn count(
        &mut self,
        kind: &str,
        filter: Option<&Expr>,
    ) -> impl Future<Output = Result<u64, DataError>> + Send;

    fn find(
        &mut self,
        kind: &str,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Document>, DataError>> + Send;

    fn apply(&mut self, changes: &[Change]) -> impl Future<Output = Result<(), DataError>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<(), DataError>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<(), DataError>> + Send;
}
