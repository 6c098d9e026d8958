//! Transaction scope spanning several repositories.

use std::sync::Arc;
use uuid::Uuid;

use crate::context::DbContext;
use crate::entity::Entity;
use crate::error::DataError;
use crate::events::{TransactionEventKind, TransactionEvents};
use crate::repository::Repository;
use crate::store::{Store, StoreTransaction};

/// Coordinates one store transaction across every repository created from
/// it.
///
/// States: idle, active (between `begin` and `commit`/`rollback`) and
/// disposed. A failed `commit` rolls back before the original error is
/// returned, so the store is never left half-committed.
///
/// ```ignore
/// let mut uow = UnitOfWork::new(DbContext::new(store));
/// let orders = uow.repository::<Order>();
/// let lines = uow.repository::<OrderLine>();
///
/// uow.begin().await?;
/// orders.add(order)?;
/// lines.add(line)?;
/// uow.commit().await?;
/// uow.dispose().await;
/// ```
pub struct UnitOfWork<S: Store> {
    context: Arc<DbContext<S>>,
    transaction: Option<Uuid>,
    events: TransactionEvents,
    disposed: bool,
}

impl<S: Store> UnitOfWork<S> {
    pub fn new(context: DbContext<S>) -> Self {
        Self::from_shared(Arc::new(context))
    }

    pub fn from_shared(context: Arc<DbContext<S>>) -> Self {
        Self {
            context,
            transaction: None,
            events: TransactionEvents::new(),
            disposed: false,
        }
    }

    pub fn context(&self) -> &Arc<DbContext<S>> {
        &self.context
    }

    /// A repository bound to this unit of work's context.
    pub fn repository<T: Entity>(&self) -> Repository<T, S> {
        Repository::new(self.context.clone())
    }

    pub fn events(&self) -> &TransactionEvents {
        &self.events
    }

    pub fn is_active(&self) -> bool {
        self.transaction.is_some()
    }

    /// Id of the active transaction, if any.
    pub fn transaction_id(&self) -> Option<Uuid> {
        self.transaction
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_usable(&self) -> Result<(), DataError> {
        if self.disposed {
            return Err(DataError::Disposed);
        }
        self.context.ensure_active()
    }

    /// Open a store transaction and attach it to the context. Until it ends,
    /// every repository of this unit of work reads and writes through it.
    pub async fn begin(&mut self) -> Result<Uuid, DataError> {
        self.ensure_usable()?;
        if self.transaction.is_some() || self.context.in_transaction() {
            return Err(DataError::AlreadyActive);
        }
        let handle = self.context.raw_store().begin().await?;
        let id = Uuid::new_v4();
        self.context.begin_scope();
        self.context.attach_transaction(handle).await;
        self.transaction = Some(id);
        tracing::info!(transaction_id = %id, "transaction started");
        self.events.emit(TransactionEventKind::Started, id);
        Ok(id)
    }

    /// Save pending changes and commit. Any failure rolls the transaction
    /// back and is then returned as is.
    pub async fn commit(&mut self) -> Result<(), DataError> {
        self.ensure_usable()?;
        let Some(id) = self.transaction.take() else {
            return Err(DataError::NoActiveTransaction);
        };

        if let Err(err) = self.context.save_changes().await {
            tracing::warn!(transaction_id = %id, error = %err, "save failed during commit, rolling back");
            self.roll_back(id, true).await;
            return Err(err);
        }

        let Some(mut handle) = self.context.take_transaction().await else {
            self.roll_back(id, true).await;
            return Err(DataError::invalid_state("transaction handle is gone"));
        };
        if let Err(err) = handle.commit().await {
            tracing::warn!(transaction_id = %id, error = %err, "commit failed, rolling back");
            Self::discard(id, handle).await;
            self.roll_back(id, true).await;
            return Err(err);
        }

        self.context.end_scope().await;
        tracing::info!(transaction_id = %id, "transaction committed");
        self.events.emit(TransactionEventKind::Committed, id);
        Ok(())
    }

    /// Revert the active transaction. Without one this does nothing.
    pub async fn rollback(&mut self) -> Result<(), DataError> {
        self.ensure_usable()?;
        if let Some(id) = self.transaction.take() {
            self.roll_back(id, true).await;
        }
        Ok(())
    }

    async fn discard(id: Uuid, mut handle: S::Transaction) {
        if let Err(err) = handle.rollback().await {
            // dropping the handle rolls back once more
            tracing::warn!(transaction_id = %id, error = %err, "rollback failed");
        }
    }

    async fn roll_back(&mut self, id: Uuid, notify: bool) {
        if let Some(handle) = self.context.take_transaction().await {
            Self::discard(id, handle).await;
        }
        self.context.reset().await;
        tracing::info!(transaction_id = %id, "transaction rolled back");
        if notify {
            self.events.emit(TransactionEventKind::RolledBack, id);
        }
    }

    /// Roll back any active transaction without notifying, then dispose the
    /// context. Idempotent.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(id) = self.transaction.take() {
            self.roll_back(id, false).await;
        }
        self.disposed = true;
        self.context.dispose();
    }
}

impl<S: Store> Drop for UnitOfWork<S> {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(id) = self.transaction.take() {
            tracing::warn!(
                transaction_id = %id,
                "unit of work dropped with an active transaction, rolling back"
            );
        }
        // disposing drops the attached handle, which rolls it back
        self.context.dispose();
    }
}

impl<S: Store> std::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("transaction_id", &self.transaction_id())
            .field("disposed", &self.disposed)
            .finish()
    }
}
