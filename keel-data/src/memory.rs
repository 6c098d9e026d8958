//! In-process [`Store`] backend.
//!
//! Documents live in per-kind tables kept in insertion order. Declared
//! references are enforced on insert and update, and deletes are
//! restricted while other documents still point at the row.
//!
//! A transaction works on a private copy of the tables taken at `begin` and
//! records the changes it applies. Commit replays that log onto the shared
//! tables under the usual version checks, so writes made by others in the
//! meantime are kept, and conflicting ones surface as
//! [`DataError::Concurrency`]. Rollback just discards the copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::entity::Reference;
use crate::error::DataError;
use crate::query::{lookup, Body, DocumentQuery, Expr};
use crate::store::{Change, Document, Store, StoreTransaction};

type Tables = HashMap<String, Vec<Document>>;
/// kind -> references declared by documents of that kind
type References = HashMap<&'static str, &'static [Reference]>;

#[derive(Default)]
struct MemoryState {
    tables: Tables,
    references: References,
    open_transactions: usize,
}

/// Thread-safe in-memory document store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    /// Number of committed documents of `kind`, bypassing any query
    /// machinery.
    pub fn len(&self, kind: &str) -> usize {
        self.lock().tables.get(kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, kind: &str) -> bool {
        self.len(kind) == 0
    }

    /// `true` while any transaction handle is still open.
    pub fn in_transaction(&self) -> bool {
        self.lock().open_transactions > 0
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl Store for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn fetch(&self, kind: &str, query: &DocumentQuery) -> Result<Vec<Document>, DataError> {
        Ok(select(&self.lock().tables, kind, query))
    }

    async fn count(&self, kind: &str, filter: Option<&Expr>) -> Result<u64, DataError> {
        Ok(count_rows(&self.lock().tables, kind, filter))
    }

    async fn find(&self, kind: &str, id: Uuid) -> Result<Option<Document>, DataError> {
        Ok(find_row(&self.lock().tables, kind, id))
    }

    async fn apply(&self, changes: &[Change]) -> Result<(), DataError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        apply_all(&mut state.tables, &mut state.references, changes)
    }

    async fn begin(&self) -> Result<MemoryTransaction, DataError> {
        let mut state = self.lock();
        state.open_transactions += 1;
        Ok(MemoryTransaction {
            shared: self.state.clone(),
            tables: state.tables.clone(),
            references: state.references.clone(),
            log: Vec::new(),
            finished: false,
        })
    }
}

fn select(tables: &Tables, kind: &str, query: &DocumentQuery) -> Vec<Document> {
    let Some(table) = tables.get(kind) else {
        return Vec::new();
    };
    let mut rows: Vec<Document> = table
        .iter()
        .filter(|doc| matches_filter(query.filter.as_ref(), &doc.body))
        .cloned()
        .collect();
    if !query.order.is_empty() {
        // sort_by is stable: ties keep insertion order
        rows.sort_by(|a, b| {
            query
                .order
                .iter()
                .map(|key| key.compare(&a.body, &b.body))
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    let offset = usize::try_from(query.offset.unwrap_or(0)).unwrap_or(usize::MAX);
    let limit = query
        .limit
        .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
    rows.into_iter().skip(offset).take(limit).collect()
}

fn count_rows(tables: &Tables, kind: &str, filter: Option<&Expr>) -> u64 {
    tables.get(kind).map_or(0, |table| {
        table
            .iter()
            .filter(|doc| matches_filter(filter, &doc.body))
            .count() as u64
    })
}

fn find_row(tables: &Tables, kind: &str, id: Uuid) -> Option<Document> {
    tables
        .get(kind)
        .and_then(|table| table.iter().find(|doc| doc.id == id))
        .cloned()
}

/// Apply `changes` in order, all or nothing.
fn apply_all(
    tables: &mut Tables,
    references: &mut References,
    changes: &[Change],
) -> Result<(), DataError> {
    let mut working = tables.clone();
    let mut working_refs = references.clone();
    for change in changes {
        apply_change(&mut working, &mut working_refs, change)?;
    }
    *tables = working;
    *references = working_refs;
    Ok(())
}

fn matches_filter(filter: Option<&Expr>, body: &Body) -> bool {
    filter.map_or(true, |f| f.evaluate(body))
}

fn apply_change(
    tables: &mut Tables,
    references: &mut References,
    change: &Change,
) -> Result<(), DataError> {
    match change {
        Change::Insert {
            kind,
            id,
            body,
            references: refs,
        } => {
            let table = tables.entry(kind.to_string()).or_default();
            if table.iter().any(|doc| doc.id == *id) {
                return Err(DataError::Constraint(format!(
                    "duplicate key {id} in {kind}"
                )));
            }
            table.push(Document {
                id: *id,
                version: 1,
                body: body.clone(),
            });
            if !refs.is_empty() {
                references.insert(*kind, *refs);
            }
            check_references(tables, kind, refs, body)
        }
        Change::Update {
            kind,
            id,
            expected_version,
            fields,
            references: refs,
        } => {
            let doc = tables
                .get_mut(*kind)
                .and_then(|table| table.iter_mut().find(|doc| doc.id == *id))
                .ok_or_else(|| {
                    DataError::Concurrency(format!("{kind} {id} no longer exists"))
                })?;
            if doc.version != *expected_version {
                return Err(DataError::Concurrency(format!(
                    "{kind} {id} was modified (expected version {expected_version}, found {})",
                    doc.version
                )));
            }
            doc.version += 1;
            doc.body.extend(fields.clone());
            let body = doc.body.clone();
            if !refs.is_empty() {
                references.insert(*kind, *refs);
            }
            check_references(tables, kind, refs, &body)
        }
        Change::Delete {
            kind,
            id,
            expected_version,
        } => {
            let table = tables.get_mut(*kind).ok_or_else(|| {
                DataError::Concurrency(format!("{kind} {id} no longer exists"))
            })?;
            let position = table
                .iter()
                .position(|doc| doc.id == *id)
                .ok_or_else(|| DataError::Concurrency(format!("{kind} {id} no longer exists")))?;
            if table[position].version != *expected_version {
                return Err(DataError::Concurrency(format!(
                    "{kind} {id} was modified (expected version {expected_version}, found {})",
                    table[position].version
                )));
            }
            table.remove(position);
            check_not_referenced(tables, references, kind, *id)
        }
    }
}

fn check_references(
    tables: &Tables,
    kind: &str,
    refs: &[Reference],
    body: &Body,
) -> Result<(), DataError> {
    for reference in refs {
        let value = lookup(body, reference.field);
        if value.is_null() {
            continue;
        }
        let target = value.as_str().and_then(|s| Uuid::parse_str(s).ok());
        let exists = target.is_some_and(|target| {
            tables
                .get(reference.target)
                .is_some_and(|table| table.iter().any(|doc| doc.id == target))
        });
        if !exists {
            return Err(DataError::Constraint(format!(
                "{kind}.{} references missing {} {value}",
                reference.field, reference.target
            )));
        }
    }
    Ok(())
}

fn check_not_referenced(
    tables: &Tables,
    references: &References,
    kind: &str,
    id: Uuid,
) -> Result<(), DataError> {
    let id_text = id.to_string();
    for (source_kind, refs) in references {
        for reference in refs.iter().filter(|r| r.target == kind) {
            let referenced = tables.get(*source_kind).is_some_and(|table| {
                table
                    .iter()
                    .any(|doc| lookup(&doc.body, reference.field).as_str() == Some(id_text.as_str()))
            });
            if referenced {
                return Err(DataError::Constraint(format!(
                    "{kind} {id} is still referenced by {source_kind}.{}",
                    reference.field
                )));
            }
        }
    }
    Ok(())
}

/// Transaction handle for [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Mutex<MemoryState>>,
    tables: Tables,
    references: References,
    log: Vec<Change>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), DataError> {
        if self.finished {
            return Err(DataError::invalid_state("transaction already finished"));
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.log.clear();
        self.tables.clear();
        let mut state = lock(&self.shared);
        state.open_transactions = state.open_transactions.saturating_sub(1);
    }
}

impl StoreTransaction for MemoryTransaction {
    async fn fetch(&mut self, kind: &str, query: &DocumentQuery) -> Result<Vec<Document>, DataError> {
        self.ensure_open()?;
        Ok(select(&self.tables, kind, query))
    }

    async fn count(&mut self, kind: &str, filter: Option<&Expr>) -> Result<u64, DataError> {
        self.ensure_open()?;
        Ok(count_rows(&self.tables, kind, filter))
    }

    async fn find(&mut self, kind: &str, id: Uuid) -> Result<Option<Document>, DataError> {
        self.ensure_open()?;
        Ok(find_row(&self.tables, kind, id))
    }

    async fn apply(&mut self, changes: &[Change]) -> Result<(), DataError> {
        self.ensure_open()?;
        apply_all(&mut self.tables, &mut self.references, changes)?;
        self.log.extend_from_slice(changes);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DataError> {
        self.ensure_open()?;
        let log = std::mem::take(&mut self.log);
        let result = {
            let mut guard = lock(&self.shared);
            let state = &mut *guard;
            apply_all(&mut state.tables, &mut state.references, &log)
        };
        self.finish();
        result
    }

    async fn rollback(&mut self) -> Result<(), DataError> {
        self.finish();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}
