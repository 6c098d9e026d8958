//! Explicit change tracking.
//!
//! The tracker keeps the last-known-persisted snapshot of every entity read
//! through a context, plus the ordered list of writes waiting for the next
//! save. Updates are diffed field by field against the snapshot so that
//! only fields that actually changed are written back.

use std::collections::HashMap;
use uuid::Uuid;

use crate::entity::Reference;
use crate::error::DataError;
use crate::query::Body;
use crate::store::{Change, Document};

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: u64,
    pub body: Body,
}

#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<(&'static str, Uuid), Snapshot>,
    pending: Vec<Change>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly read document. An entity that is already tracked
    /// keeps its snapshot.
    pub fn track(&mut self, kind: &'static str, doc: &Document) {
        self.snapshots.entry((kind, doc.id)).or_insert_with(|| Snapshot {
            version: doc.version,
            body: doc.body.clone(),
        });
    }

    pub fn snapshot(&self, kind: &'static str, id: Uuid) -> Option<&Snapshot> {
        self.snapshots.get(&(kind, id))
    }

    pub fn is_tracked(&self, kind: &'static str, id: Uuid) -> bool {
        self.snapshots.contains_key(&(kind, id))
    }

    pub fn pending(&self) -> &[Change] {
        &self.pending
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_insert(&self, kind: &'static str, id: Uuid) -> Option<&Body> {
        self.pending.iter().find_map(|change| match change {
            Change::Insert { kind: k, id: i, body, .. } if *k == kind && *i == id => Some(body),
            _ => None,
        })
    }

    /// The tracked body with a pending update's fields applied, that is, the
    /// entity as it will be stored once the update is saved.
    pub fn pending_update(&self, kind: &'static str, id: Uuid) -> Option<Body> {
        let index = self.position(kind, id, |c| matches!(c, Change::Update { .. }))?;
        let Change::Update { fields, .. } = &self.pending[index] else {
            return None;
        };
        let mut body = self.snapshot(kind, id)?.body.clone();
        body.extend(fields.clone());
        Some(body)
    }

    pub fn is_pending_delete(&self, kind: &'static str, id: Uuid) -> bool {
        self.position(kind, id, |c| matches!(c, Change::Delete { .. }))
            .is_some()
    }

    fn position(
        &self,
        kind: &'static str,
        id: Uuid,
        pred: impl Fn(&Change) -> bool,
    ) -> Option<usize> {
        self.pending
            .iter()
            .position(|c| c.kind() == kind && c.id() == id && pred(c))
    }

    pub fn register_insert(
        &mut self,
        kind: &'static str,
        id: Uuid,
        body: Body,
        references: &'static [Reference],
    ) -> Result<(), DataError> {
        if self.is_tracked(kind, id) || self.pending_insert(kind, id).is_some() {
            return Err(DataError::InvalidState(format!(
                "{kind} {id} is already tracked"
            )));
        }
        self.pending.push(Change::Insert {
            kind,
            id,
            body,
            references,
        });
        Ok(())
    }

    /// Diff `current` against the snapshot (or the pending insert) and
    /// record the changed fields. Returns the names of the dirty fields.
    pub fn register_update(
        &mut self,
        kind: &'static str,
        id: Uuid,
        current: Body,
        references: &'static [Reference],
    ) -> Result<Vec<String>, DataError> {
        if self.is_pending_delete(kind, id) {
            return Err(DataError::InvalidState(format!(
                "{kind} {id} is marked for deletion"
            )));
        }

        if let Some(index) = self.position(kind, id, |c| matches!(c, Change::Insert { .. })) {
            if let Change::Insert { body, .. } = &mut self.pending[index] {
                let dirty: Vec<String> = diff(body, &current).keys().cloned().collect();
                *body = current;
                return Ok(dirty);
            }
        }

        let snapshot = self.snapshot(kind, id).ok_or_else(|| {
            DataError::NotFound(format!("{kind} {id} is not tracked"))
        })?;
        let fields = diff(&snapshot.body, &current);
        let expected_version = snapshot.version;
        let dirty: Vec<String> = fields.keys().cloned().collect();

        let existing = self.position(kind, id, |c| matches!(c, Change::Update { .. }));
        match (existing, fields.is_empty()) {
            (Some(index), true) => {
                self.pending.remove(index);
            }
            (Some(index), false) => {
                self.pending[index] = Change::Update {
                    kind,
                    id,
                    expected_version,
                    fields,
                    references,
                };
            }
            (None, true) => {}
            (None, false) => self.pending.push(Change::Update {
                kind,
                id,
                expected_version,
                fields,
                references,
            }),
        }
        Ok(dirty)
    }

    pub fn register_delete(&mut self, kind: &'static str, id: Uuid) -> Result<(), DataError> {
        if let Some(index) = self.position(kind, id, |c| matches!(c, Change::Insert { .. })) {
            // never persisted: cancelling the insert is enough
            self.pending.remove(index);
            return Ok(());
        }
        if self.is_pending_delete(kind, id) {
            return Ok(());
        }
        let expected_version = self
            .snapshot(kind, id)
            .map(|s| s.version)
            .ok_or_else(|| DataError::NotFound(format!("{kind} {id} is not tracked")))?;
        self.pending
            .retain(|c| !(c.kind() == kind && c.id() == id));
        self.pending.push(Change::Delete {
            kind,
            id,
            expected_version,
        });
        Ok(())
    }

    /// Fold the first `applied` pending changes into the snapshots after the
    /// store accepted them.
    pub fn accept(&mut self, applied: usize) {
        let applied = applied.min(self.pending.len());
        for change in self.pending.drain(..applied) {
            match change {
                Change::Insert { kind, id, body, .. } => {
                    self.snapshots.insert((kind, id), Snapshot { version: 1, body });
                }
                Change::Update { kind, id, fields, .. } => {
                    if let Some(snapshot) = self.snapshots.get_mut(&(kind, id)) {
                        snapshot.version += 1;
                        snapshot.body.extend(fields);
                    }
                }
                Change::Delete { kind, id, .. } => {
                    self.snapshots.remove(&(kind, id));
                }
            }
        }
    }

    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Forget everything: pending writes and snapshots.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.snapshots.clear();
    }
}

/// Fields of `current` that differ from `original`. Fields that disappeared
/// are reported as `null`.
fn diff(original: &Body, current: &Body) -> Body {
    let mut changed = Body::new();
    for (key, value) in current {
        if original.get(key) != Some(value) {
            changed.insert(key.clone(), value.clone());
        }
    }
    for key in original.keys() {
        if !current.contains_key(key) {
            changed.insert(key.clone(), serde_json::Value::Null);
        }
    }
    changed
}
