//! Transaction lifecycle notifications.
//!
//! Handlers are plain synchronous callbacks. They run on the caller's task,
//! in registration order, before the operation that triggered them returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionEventKind {
    Started,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionEvent {
    pub kind: TransactionEventKind,
    pub transaction_id: Uuid,
}

/// Returned by [`TransactionEvents::subscribe`]; pass it back to
/// [`unsubscribe`](TransactionEvents::unsubscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&TransactionEvent) + Send + Sync>;

/// Handler registry for transaction events. Clones share the registry.
#[derive(Clone, Default)]
pub struct TransactionEvents {
    handlers: Arc<RwLock<Vec<(SubscriptionId, Handler)>>>,
    next_id: Arc<AtomicU64>,
}

impl TransactionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every event kind.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a handler for a single event kind.
    pub fn on<F>(&self, kind: TransactionEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if event.kind == kind {
                handler(event)
            }
        })
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn emit(&self, kind: TransactionEventKind, transaction_id: Uuid) {
        let event = TransactionEvent {
            kind,
            transaction_id,
        };
        // snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }
}

impl std::fmt::Debug for TransactionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEvents")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
