// In-memory key-column-value backend
// Several managers opened over one `InMemoryStorage` behave like separate
// processes sharing a cluster: they see the same data but keep their own
// transactions, fault injection and local partition.

mod database;
mod transaction;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use keyward_common::error::describe_cell;
use keyward_common::{
    ConsistencyLevel, Entry, KeyColumnValueStore, KeyRange, SliceQuery, StorageError,
    StorageResult, StoreFeatures, StoreManager,
};

use database::{CellWrite, Database};
pub use transaction::InMemoryTransaction;

/// Shared physical substrate of the in-memory backend
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    databases: DashMap<String, Arc<Database>>,
    /// Serializes transactional commits (validation + apply).
    commit_latch: Mutex<()>,
    version: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn database(&self, name: &str) -> Arc<Database> {
        self.databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Database::new(name)))
            .clone()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops the contents of every database.
    pub fn clear(&self) {
        for db in self.databases.iter() {
            db.value().clear();
        }
    }
}

/// Consistency model a manager exposes over the shared storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Multi-key transactions validated at commit; no conditional writes.
    Transactional,
    /// Immediate per-key atomic writes and conditional writes; no isolation.
    ConsistentKey,
}

impl StorageMode {
    fn features(self) -> StoreFeatures {
        match self {
            StorageMode::Transactional => StoreFeatures {
                supports_transactions: true,
                ..Default::default()
            },
            StorageMode::ConsistentKey => StoreFeatures {
                supports_consistent_key_operations: true,
                ..Default::default()
            },
        }
    }
}

/// Makes a bounded number of upcoming store calls fail with `Unavailable`.
#[derive(Debug, Default)]
pub struct FaultInjector {
    remaining: AtomicU32,
}

impl FaultInjector {
    pub fn fail_next(&self, count: u32) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    pub(crate) fn check(&self, operation: &str) -> StorageResult<()> {
        let injected = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(operation, "Injected storage failure");
            return Err(StorageError::Unavailable(format!(
                "injected failure during {}",
                operation
            )));
        }
        Ok(())
    }
}

/// Store manager over an [`InMemoryStorage`]
pub struct InMemoryStoreManager {
    storage: Arc<InMemoryStorage>,
    mode: StorageMode,
    local_partition: Option<KeyRange>,
    faults: Arc<FaultInjector>,
}

impl InMemoryStoreManager {
    pub fn new(storage: Arc<InMemoryStorage>, mode: StorageMode) -> Self {
        info!(?mode, "Opening in-memory store manager");
        Self {
            storage,
            mode,
            local_partition: None,
            faults: Arc::new(FaultInjector::default()),
        }
    }

    pub fn transactional(storage: Arc<InMemoryStorage>) -> Self {
        Self::new(storage, StorageMode::Transactional)
    }

    pub fn consistent_key(storage: Arc<InMemoryStorage>) -> Self {
        Self::new(storage, StorageMode::ConsistentKey)
    }

    /// Reports `partition` as the locally stored key range.
    pub fn with_local_key_partition(mut self, partition: KeyRange) -> Self {
        self.local_partition = Some(partition);
        self
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    /// Fails the next `count` store operations or commits of this manager.
    pub fn fail_next_operations(&self, count: u32) {
        self.faults.fail_next(count);
    }
}

#[async_trait]
impl StoreManager for InMemoryStoreManager {
    type Tx = InMemoryTransaction;
    type Store = InMemoryStore;

    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            has_local_key_partition: self.local_partition.is_some(),
            ..self.mode.features()
        }
    }

    async fn open_database(&self, name: &str) -> StorageResult<Arc<InMemoryStore>> {
        Ok(Arc::new(InMemoryStore {
            database: self.storage.database(name),
            storage: self.storage.clone(),
            mode: self.mode,
            local_partition: self.local_partition.clone(),
            faults: self.faults.clone(),
        }))
    }

    async fn begin_transaction(&self, level: ConsistencyLevel) -> StorageResult<InMemoryTransaction> {
        self.faults.check("begin transaction")?;
        Ok(InMemoryTransaction::new(
            level,
            self.mode,
            self.storage.clone(),
            self.faults.clone(),
        ))
    }

    async fn clear_storage(&self) -> StorageResult<()> {
        self.storage.clear();
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// One database opened through an [`InMemoryStoreManager`]
pub struct InMemoryStore {
    database: Arc<Database>,
    storage: Arc<InMemoryStorage>,
    mode: StorageMode,
    local_partition: Option<KeyRange>,
    faults: Arc<FaultInjector>,
}

impl InMemoryStore {
    fn check(&self, operation: &str, txh: &InMemoryTransaction) -> StorageResult<()> {
        if !txh.belongs_to(&self.storage) {
            return Err(StorageError::InvalidState(format!(
                "transaction {} was not opened on the storage of '{}'",
                txh.id(),
                self.database.name()
            )));
        }
        txh.ensure_open()?;
        self.faults.check(operation)
    }
}

#[async_trait]
impl KeyColumnValueStore for InMemoryStore {
    type Tx = InMemoryTransaction;

    fn name(&self) -> &str {
        self.database.name()
    }

    async fn get(&self, key: &[u8], column: &[u8], txh: &InMemoryTransaction) -> StorageResult<Option<Bytes>> {
        self.check("get", txh)?;
        match self.mode {
            StorageMode::Transactional => txh.read(&self.database, key, column),
            StorageMode::ConsistentKey => Ok(self.database.read(key, column).value),
        }
    }

    async fn get_slice(
        &self,
        key: &[u8],
        query: &SliceQuery,
        txh: &InMemoryTransaction,
    ) -> StorageResult<Vec<Entry>> {
        self.check("get slice", txh)?;
        match self.mode {
            StorageMode::Transactional => txh.read_slice(&self.database, key, query),
            StorageMode::ConsistentKey => Ok(self
                .database
                .slice(key, query)
                .into_iter()
                .map(|(entry, _)| entry)
                .collect()),
        }
    }

    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
        txh: &InMemoryTransaction,
    ) -> StorageResult<()> {
        self.check("mutate", txh)?;
        let key = Bytes::copy_from_slice(key);
        let writes: Vec<CellWrite> = deletions
            .into_iter()
            .map(|column| CellWrite {
                key: key.clone(),
                column,
                value: None,
            })
            .chain(additions.into_iter().map(|entry| CellWrite {
                key: key.clone(),
                column: entry.column,
                value: Some(entry.value),
            }))
            .collect();

        match self.mode {
            StorageMode::Transactional => txh.buffer(&self.database, writes),
            StorageMode::ConsistentKey => {
                self.database.apply(&writes, self.storage.next_version());
                Ok(())
            }
        }
    }

    async fn conditional_write(
        &self,
        key: &[u8],
        column: &[u8],
        new_value: Option<Bytes>,
        expected: Option<Bytes>,
        txh: &InMemoryTransaction,
    ) -> StorageResult<()> {
        if self.mode != StorageMode::ConsistentKey {
            return Err(StorageError::Unsupported(format!(
                "store '{}' has no consistent-key operations",
                self.name()
            )));
        }
        self.check("conditional write", txh)?;

        let write = CellWrite {
            key: Bytes::copy_from_slice(key),
            column: Bytes::copy_from_slice(column),
            value: new_value,
        };
        if self
            .database
            .compare_and_set(&write, expected.as_deref(), self.storage.next_version())
        {
            Ok(())
        } else {
            Err(StorageError::Conflict(format!(
                "{}:{} does not hold the expected value",
                self.name(),
                describe_cell(key, column)
            )))
        }
    }

    async fn acquire_lock(
        &self,
        _key: &[u8],
        _column: &[u8],
        _expected: Option<Bytes>,
        _txh: &InMemoryTransaction,
    ) -> StorageResult<()> {
        Err(StorageError::Unsupported(format!(
            "store '{}' has no native locking, open it through a lock adapter",
            self.name()
        )))
    }

    fn local_key_partition(&self) -> StorageResult<KeyRange> {
        self.local_partition.clone().ok_or_else(|| {
            StorageError::Unsupported(format!(
                "store '{}' does not report a local key partition",
                self.name()
            ))
        })
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
