// In-memory transactions
// Transactional mode buffers writes and validates the versions of everything
// it read when committing. Consistent-key mode writes through immediately, so
// its transactions only track whether they are still open.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use keyward_common::error::describe_cell;
use keyward_common::{ConsistencyLevel, Entry, SliceQuery, StorageError, StorageResult, StoreTransaction};

use super::database::{CellWrite, Database};
use super::{FaultInjector, InMemoryStorage, StorageMode};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Open,
    Committed,
    /// Commit validation failed; only a rollback is accepted.
    Failed,
    RolledBack,
}

/// (database, key, column)
type CellId = (String, Bytes, Bytes);

#[derive(Debug)]
struct TxState {
    status: TxStatus,
    /// Version of every committed cell this transaction observed.
    reads: HashMap<CellId, u64>,
    /// Buffered writes, last write per cell wins.
    writes: BTreeMap<CellId, Option<Bytes>>,
}

pub struct InMemoryTransaction {
    id: u64,
    level: ConsistencyLevel,
    mode: StorageMode,
    storage: Arc<InMemoryStorage>,
    faults: Arc<FaultInjector>,
    state: Mutex<TxState>,
}

impl std::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("mode", &self.mode)
            .finish()
    }
}

impl InMemoryTransaction {
    pub(crate) fn new(
        level: ConsistencyLevel,
        mode: StorageMode,
        storage: Arc<InMemoryStorage>,
        faults: Arc<FaultInjector>,
    ) -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            level,
            mode,
            storage,
            faults,
            state: Mutex::new(TxState {
                status: TxStatus::Open,
                reads: HashMap::new(),
                writes: BTreeMap::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().status == TxStatus::Open
    }

    pub(crate) fn belongs_to(&self, storage: &Arc<InMemoryStorage>) -> bool {
        Arc::ptr_eq(&self.storage, storage)
    }

    pub(crate) fn ensure_open(&self) -> StorageResult<()> {
        match self.state.lock().status {
            TxStatus::Open => Ok(()),
            status => Err(StorageError::InvalidState(format!(
                "transaction {} already finished ({:?})",
                self.id, status
            ))),
        }
    }

    pub(crate) fn read(&self, db: &Database, key: &[u8], column: &[u8]) -> StorageResult<Option<Bytes>> {
        let mut state = self.state.lock();
        let cell: CellId = (
            db.name().to_string(),
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(column),
        );
        if let Some(pending) = state.writes.get(&cell) {
            return Ok(pending.clone());
        }

        let read = db.read(key, column);
        state.reads.entry(cell).or_insert(read.version);
        Ok(read.value)
    }

    pub(crate) fn read_slice(
        &self,
        db: &Database,
        key: &[u8],
        query: &SliceQuery,
    ) -> StorageResult<Vec<Entry>> {
        let mut state = self.state.lock();
        let key = Bytes::copy_from_slice(key);

        let mut merged: BTreeMap<Bytes, Option<Bytes>> = BTreeMap::new();
        for (entry, version) in db.slice(&key, &SliceQuery { limit: None, ..query.clone() }) {
            state
                .reads
                .entry((db.name().to_string(), key.clone(), entry.column.clone()))
                .or_insert(version);
            merged.insert(entry.column, Some(entry.value));
        }
        for ((name, row, column), value) in state.writes.iter() {
            if name == db.name() && row == &key && query.contains(column) {
                merged.insert(column.clone(), value.clone());
            }
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(merged
            .into_iter()
            .filter_map(|(column, value)| value.map(|value| Entry::new(column, value)))
            .take(limit)
            .collect())
    }

    pub(crate) fn buffer(&self, db: &Database, writes: Vec<CellWrite>) -> StorageResult<()> {
        let mut state = self.state.lock();
        for write in writes {
            state
                .writes
                .insert((db.name().to_string(), write.key, write.column), write.value);
        }
        Ok(())
    }

    fn finish_transactional_commit(&self, state: &mut TxState) -> StorageResult<()> {
        let _latch = self.storage.commit_latch.lock();

        for ((name, key, column), seen) in &state.reads {
            let current = self.storage.database(name).read(key, column).version;
            if current != *seen {
                debug!(
                    tx = self.id,
                    database = %name,
                    cell = %describe_cell(key, column),
                    seen,
                    current,
                    "Commit validation failed"
                );
                return Err(StorageError::Conflict(format!(
                    "{}:{} changed since it was read by transaction {}",
                    name,
                    describe_cell(key, column),
                    self.id
                )));
            }
        }

        if state.writes.is_empty() {
            return Ok(());
        }

        let version = self.storage.next_version();
        let mut per_database: BTreeMap<&str, Vec<CellWrite>> = BTreeMap::new();
        for ((name, key, column), value) in &state.writes {
            per_database.entry(name.as_str()).or_default().push(CellWrite {
                key: key.clone(),
                column: column.clone(),
                value: value.clone(),
            });
        }
        for (name, writes) in per_database {
            self.storage.database(name).apply(&writes, version);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    fn consistency(&self) -> ConsistencyLevel {
        self.level
    }

    async fn commit(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.status != TxStatus::Open {
            return Err(StorageError::InvalidState(format!(
                "cannot commit transaction {} ({:?})",
                self.id, state.status
            )));
        }
        self.faults.check("commit")?;

        let result = match self.mode {
            StorageMode::Transactional => self.finish_transactional_commit(&mut state),
            StorageMode::ConsistentKey => Ok(()),
        };

        // A commit that failed validation cannot be retried; the caller rolls
        // back and starts over in a new transaction.
        state.status = if result.is_ok() {
            TxStatus::Committed
        } else {
            TxStatus::Failed
        };
        state.reads.clear();
        state.writes.clear();
        result
    }

    async fn rollback(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        match state.status {
            TxStatus::Open | TxStatus::Failed => {
                state.status = TxStatus::RolledBack;
                state.reads.clear();
                state.writes.clear();
                Ok(())
            }
            status => Err(StorageError::InvalidState(format!(
                "cannot roll back transaction {} ({:?})",
                self.id, status
            ))),
        }
    }
}
