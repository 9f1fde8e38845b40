// Versioned in-memory rows
// Every cell carries the storage-wide version of its last write; deletes keep
// a tombstone so a delete followed by a re-insert still reads as a change.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::RwLock;

use keyward_common::{Entry, SliceQuery};

#[derive(Debug, Clone)]
struct Cell {
    value: Option<Bytes>,
    version: u64,
}

type Row = BTreeMap<Bytes, Cell>;

/// One named database of an [`super::InMemoryStorage`].
#[derive(Debug)]
pub(crate) struct Database {
    name: String,
    rows: RwLock<BTreeMap<Bytes, Row>>,
}

/// A cell as seen by a reader: its live value and the version it was read at.
/// Cells that were never written read at version 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VersionedValue {
    pub value: Option<Bytes>,
    pub version: u64,
}

/// One cell change applied by a commit or a consistent-key write.
#[derive(Debug, Clone)]
pub(crate) struct CellWrite {
    pub key: Bytes,
    pub column: Bytes,
    pub value: Option<Bytes>,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self, key: &[u8], column: &[u8]) -> VersionedValue {
        let rows = self.rows.read();
        match rows.get(key).and_then(|row| row.get(column)) {
            Some(cell) => VersionedValue {
                value: cell.value.clone(),
                version: cell.version,
            },
            None => VersionedValue {
                value: None,
                version: 0,
            },
        }
    }

    /// Live cells of a row within the query range, with their versions.
    pub fn slice(&self, key: &[u8], query: &SliceQuery) -> Vec<(Entry, u64)> {
        let rows = self.rows.read();
        let Some(row) = rows.get(key) else {
            return Vec::new();
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        row.range(query.bounds())
            .filter_map(|(column, cell)| {
                cell.value
                    .as_ref()
                    .map(|value| (Entry::new(column.clone(), value.clone()), cell.version))
            })
            .take(limit)
            .collect()
    }

    pub fn apply(&self, writes: &[CellWrite], version: u64) {
        let mut rows = self.rows.write();
        for write in writes {
            rows.entry(write.key.clone()).or_default().insert(
                write.column.clone(),
                Cell {
                    value: write.value.clone(),
                    version,
                },
            );
        }
    }

    /// Applies `write` only if the cell currently holds `expected`.
    pub fn compare_and_set(&self, write: &CellWrite, expected: Option<&[u8]>, version: u64) -> bool {
        let mut rows = self.rows.write();
        let row = rows.entry(write.key.clone()).or_default();
        let current = row.get(&write.column).and_then(|cell| cell.value.as_deref());
        if current != expected {
            return false;
        }
        row.insert(
            write.column.clone(),
            Cell {
                value: write.value.clone(),
                version,
            },
        );
        true
    }

    pub fn clear(&self) {
        self.rows.write().clear();
    }
}
