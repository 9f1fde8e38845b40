//! Shared harness for the keyward integration tests
//!
//! Simulates several hosts inside one process: every host gets its own store
//! manager over one shared [`InMemoryStorage`], its own instance id and its
//! own local mediator namespace (`store<i>`), so local and remote contention
//! can both be exercised. All hosts share one [`ManualClock`].

use std::sync::{Arc, Once};

use bytes::Bytes;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use keyward_common::{
    ConsistencyLevel, Entry, KeyColumnValueStore, KeyRange, KeywardConfig, ManualClock,
    SliceQuery, StorageResult, StoreManager, StoreTransaction,
};
use keyward_idauthority::{FixedBlockSizer, IdAuthority, IdManager};
use keyward_locking::{
    KeyColumn, LocalLockMediators, LockingStore, LockingStoreManager, LockingTransaction,
};
use keyward_storage::{InMemoryStorage, InMemoryStore, InMemoryStoreManager, StorageMode};

pub const LOCK_EXPIRE_MS: u64 = 1000;
pub const LOCK_WAIT_MS: u64 = 100;
pub const ID_RETRY_COUNT: u32 = 100;
pub const ID_WAIT_MS: u64 = 100;

/// Clock start, far from zero so timestamps look like real ones.
const CLOCK_START_MS: i64 = 1_700_000_000_000;

pub const DATA_STORE: &str = "testStore";

/// Installs a test log writer once, honouring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Storage model the tests run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Transactional,
    ConsistentKey,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Transactional, Backend::ConsistentKey];

    fn mode(self) -> StorageMode {
        match self {
            Backend::Transactional => StorageMode::Transactional,
            Backend::ConsistentKey => StorageMode::ConsistentKey,
        }
    }

    pub fn manager(self, storage: &Arc<InMemoryStorage>) -> InMemoryStoreManager {
        InMemoryStoreManager::new(storage.clone(), self.mode())
    }
}

/// Configuration of host `i`.
pub fn host_config(i: usize) -> KeywardConfig {
    KeywardConfig {
        lock_expire_ms: LOCK_EXPIRE_MS,
        lock_wait_ms: LOCK_WAIT_MS,
        lock_retry_count: 3,
        local_lock_mediator_prefix: format!("store{}", i),
        ids_retry_count: ID_RETRY_COUNT,
        ids_wait_ms: ID_WAIT_MS,
        instance_id: format!("host{}", i),
    }
}

pub fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

pub type Tx = LockingTransaction<InMemoryStore>;

pub struct LockHost {
    pub raw: Arc<InMemoryStoreManager>,
    pub manager: LockingStoreManager<InMemoryStoreManager>,
    pub store: Arc<LockingStore<InMemoryStore>>,
}

impl LockHost {
    pub async fn begin(&self) -> Tx {
        self.manager
            .begin_transaction(ConsistencyLevel::Default)
            .await
            .expect("begin transaction")
    }

    /// Number of claim records stored for (key, column), live or not.
    /// Always zero for adapters that write no claims.
    pub async fn claim_records(&self, key: &str, column: &str) -> usize {
        let LockingStore::ConsistentKey(store) = self.store.as_ref() else {
            return 0;
        };
        let tx = self
            .raw
            .begin_transaction(ConsistencyLevel::KeyConsistent)
            .await
            .expect("begin transaction");
        let row = KeyColumn::new(bytes(key), bytes(column)).lock_row();
        let records = store
            .lock_store()
            .get_slice(&row, &SliceQuery::all(), &tx)
            .await
            .expect("read lock claims")
            .len();
        tx.rollback().await.expect("rollback");
        records
    }

    /// Committed value of (key, column).
    pub async fn read(&self, key: &str, column: &str) -> Option<Bytes> {
        let tx = self.begin().await;
        let value = self
            .store
            .get(key.as_bytes(), column.as_bytes(), &tx)
            .await
            .expect("read");
        tx.rollback().await.expect("rollback");
        value
    }
}

pub struct LockCluster {
    pub backend: Backend,
    pub clock: Arc<ManualClock>,
    pub mediators: Arc<LocalLockMediators>,
    pub hosts: Vec<LockHost>,
}

impl LockCluster {
    pub async fn open(backend: Backend, hosts: usize) -> Self {
        init_tracing();
        let clock = ManualClock::shared(CLOCK_START_MS);
        let mediators = Arc::new(LocalLockMediators::new(clock.clone()));
        let storage = InMemoryStorage::new();

        let mut opened = Vec::with_capacity(hosts);
        for i in 0..hosts {
            let raw = Arc::new(backend.manager(&storage));
            let manager = LockingStoreManager::new(raw.clone(), &host_config(i), mediators.clone())
                .expect("locking store manager");
            let store = manager.open_database(DATA_STORE).await.expect("open store");
            opened.push(LockHost {
                raw,
                manager,
                store,
            });
        }

        Self {
            backend,
            clock,
            mediators,
            hosts: opened,
        }
    }

    pub fn host(&self, i: usize) -> &LockHost {
        &self.hosts[i]
    }
}

/// Locks (key, column) and writes `value` to it.
pub async fn lock_and_write(
    host: &LockHost,
    tx: &Tx,
    key: &str,
    column: &str,
    value: &str,
    expected: Option<&str>,
) -> StorageResult<()> {
    host.store
        .acquire_lock(key.as_bytes(), column.as_bytes(), expected.map(bytes), tx)
        .await?;
    host.store
        .mutate(
            key.as_bytes(),
            vec![Entry::new(bytes(column), bytes(value))],
            vec![],
            tx,
        )
        .await
}

/// Commits `tx` if `result` succeeded, rolls it back otherwise.
pub async fn finish(tx: &Tx, result: StorageResult<()>) -> StorageResult<()> {
    match result {
        Ok(()) => tx.commit().await,
        Err(e) => {
            tx.rollback().await?;
            Err(e)
        }
    }
}

pub struct IdHost {
    pub raw: Arc<InMemoryStoreManager>,
    pub ids: IdManager<InMemoryStoreManager>,
}

pub struct IdCluster {
    pub clock: Arc<ManualClock>,
    pub hosts: Vec<Arc<IdHost>>,
}

impl IdCluster {
    /// Opens `hosts` authorities over one storage, each allocating blocks of
    /// `block_size`. A `local_partition` is reported by every host's backend.
    pub async fn open(
        backend: Backend,
        hosts: usize,
        block_size: i64,
        local_partition: Option<KeyRange>,
    ) -> Self {
        init_tracing();
        let clock = ManualClock::shared(CLOCK_START_MS);
        let storage = InMemoryStorage::new();

        let mut opened = Vec::with_capacity(hosts);
        for i in 0..hosts {
            let mut manager = backend.manager(&storage);
            if let Some(partition) = &local_partition {
                manager = manager.with_local_key_partition(partition.clone());
            }
            let raw = Arc::new(manager);
            let ids = IdManager::open(raw.clone(), &host_config(i), clock.clone())
                .await
                .expect("open id authority");
            ids.set_id_block_sizer(Arc::new(FixedBlockSizer(block_size)));
            opened.push(Arc::new(IdHost { raw, ids }));
        }

        Self {
            clock,
            hosts: opened,
        }
    }
}
