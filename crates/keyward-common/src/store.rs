//! Key-column-value store contract
//!
//! These traits describe the storage collaborator the locking layer and the
//! ID authority run against: an ordered `key -> (column -> value)` store that
//! offers per-key atomic conditional writes, native multi-key transactions,
//! or both. Backends advertise what they offer through [`StoreFeatures`].

use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{StorageError, StorageResult};

/// Capability flags reported by a store manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreFeatures {
    /// The backend serializes conflicting writers itself; `acquire_lock` works as-is.
    pub supports_native_locking: bool,
    /// Multi-key transactions with isolation, conflicts surface at commit.
    pub supports_transactions: bool,
    /// Per-key atomic reads and conditional writes.
    pub supports_consistent_key_operations: bool,
    /// The backend can report the key range stored locally.
    pub has_local_key_partition: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConsistencyLevel {
    #[default]
    Default,
    KeyConsistent,
}

/// A single column/value cell of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    pub column: Bytes,
    pub value: Bytes,
}

impl Entry {
    pub fn new(column: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Column range of one row, `start` inclusive and `end` exclusive.
/// An unbounded end reads to the end of the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceQuery {
    pub start: Bytes,
    pub end: Option<Bytes>,
    pub limit: Option<usize>,
}

impl SliceQuery {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
            limit: None,
        }
    }

    /// Every column of the row.
    pub fn all() -> Self {
        Self {
            start: Bytes::new(),
            end: None,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn bounds(&self) -> (Bound<Bytes>, Bound<Bytes>) {
        let end = match &self.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        (Bound::Included(self.start.clone()), end)
    }

    pub fn contains(&self, column: &[u8]) -> bool {
        column >= self.start.as_ref() && self.end.as_ref().is_none_or(|end| column < end.as_ref())
    }
}

/// Byte range of keys a process prefers to own, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub low: Bytes,
    pub high: Bytes,
}

impl KeyRange {
    pub fn new(low: impl Into<Bytes>, high: impl Into<Bytes>) -> Self {
        Self {
            low: low.into(),
            high: high.into(),
        }
    }
}

/// Handle of one storage transaction.
///
/// Transactions are shared by reference across store calls, so finishing
/// them takes `&self`. Finishing twice is an `InvalidState` error, except
/// that a transaction whose commit failed must still be rolled back once.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    fn consistency(&self) -> ConsistencyLevel;

    async fn commit(&self) -> StorageResult<()>;

    async fn rollback(&self) -> StorageResult<()>;
}

/// One named database of a key-column-value store.
#[async_trait]
pub trait KeyColumnValueStore: Send + Sync {
    type Tx: StoreTransaction;

    fn name(&self) -> &str;

    async fn get(&self, key: &[u8], column: &[u8], txh: &Self::Tx) -> StorageResult<Option<Bytes>>;

    async fn get_slice(
        &self,
        key: &[u8],
        query: &SliceQuery,
        txh: &Self::Tx,
    ) -> StorageResult<Vec<Entry>>;

    async fn contains_key_column(
        &self,
        key: &[u8],
        column: &[u8],
        txh: &Self::Tx,
    ) -> StorageResult<bool> {
        Ok(self.get(key, column, txh).await?.is_some())
    }

    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()>;

    /// Writes `new_value` (or deletes the cell for `None`) only if the cell
    /// currently holds `expected` (`None` meaning absent). A mismatch is a
    /// `Conflict`.
    async fn conditional_write(
        &self,
        key: &[u8],
        column: &[u8],
        new_value: Option<Bytes>,
        expected: Option<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()>;

    async fn acquire_lock(
        &self,
        key: &[u8],
        column: &[u8],
        expected: Option<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()>;

    fn local_key_partition(&self) -> StorageResult<KeyRange> {
        Err(StorageError::Unsupported(format!(
            "store '{}' does not report a local key partition",
            self.name()
        )))
    }

    async fn close(&self) -> StorageResult<()>;
}

/// Opens databases and transactions of one backend.
#[async_trait]
pub trait StoreManager: Send + Sync {
    type Tx: StoreTransaction + 'static;
    type Store: KeyColumnValueStore<Tx = Self::Tx> + 'static;

    fn features(&self) -> StoreFeatures;

    async fn open_database(&self, name: &str) -> StorageResult<Arc<Self::Store>>;

    async fn begin_transaction(&self, level: ConsistencyLevel) -> StorageResult<Self::Tx>;

    /// Drops every database. Test harnesses call this between runs.
    async fn clear_storage(&self) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}
