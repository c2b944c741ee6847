use serde::{Deserialize, Serialize};

use eventsync_core::{Row, SqlValue};

use crate::error::StorageError;

/// Before/after image of one row, addressed by primary key. `None` means the
/// row does not exist on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetEntry {
    pub table: String,
    pub primary_key: SqlValue,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

/// Reversible diff of a state mutation, at most one entry per row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    entries: Vec<ChangesetEntry>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChangesetEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Records a row change. A row touched twice keeps its first before-image
    /// and its latest after-image.
    pub fn record(
        &mut self,
        table: &str,
        primary_key: SqlValue,
        before: Option<Row>,
        after: Option<Row>,
    ) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.table == table && e.primary_key == primary_key)
        {
            entry.after = after;
            return;
        }
        self.entries.push(ChangesetEntry {
            table: table.to_string(),
            primary_key,
            before,
            after,
        });
    }

    /// Drops entries whose before and after images are identical.
    pub fn prune(&mut self) {
        self.entries.retain(|e| e.before != e.after);
    }

    /// The changeset undoing this one.
    pub fn invert(&self) -> Changeset {
        Changeset {
            entries: self
                .entries
                .iter()
                .rev()
                .map(|e| ChangesetEntry {
                    table: e.table.clone(),
                    primary_key: e.primary_key.clone(),
                    before: e.after.clone(),
                    after: e.before.clone(),
                })
                .collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        rmp_serde::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Short human-readable summary, stored next to the changeset.
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                let op = match (&e.before, &e.after) {
                    (None, Some(_)) => "insert",
                    (Some(_), None) => "delete",
                    _ => "update",
                };
                format!("{op} {}[{:?}]", e.table, e.primary_key)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
