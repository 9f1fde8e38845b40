//! ID authority contract and shared allocation plumbing

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, info};

use keyward_common::constants::ID_STORE_NAME;
use keyward_common::retry::{self, RetryPolicy};
use keyward_common::{
    KeyColumnValueStore, KeyRange, KeywardConfig, LeaseClock, StorageError, StorageResult,
    StoreManager,
};

use crate::codec::validate_local_partition;

/// Half-open range `[start, end)` of IDs owned by one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdBlock {
    pub start: i64,
    pub end: i64,
}

impl IdBlock {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, id: i64) -> bool {
        self.start <= id && id < self.end
    }
}

impl fmt::Display for IdBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Block size policy, consulted on every allocation.
pub trait IdBlockSizer: Send + Sync {
    fn block_size(&self, partition: u32) -> i64;
}

impl<F> IdBlockSizer for F
where
    F: Fn(u32) -> i64 + Send + Sync,
{
    fn block_size(&self, partition: u32) -> i64 {
        self(partition)
    }
}

/// Same block size for every partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBlockSizer(pub i64);

impl IdBlockSizer for FixedBlockSizer {
    fn block_size(&self, _partition: u32) -> i64 {
        self.0
    }
}

#[async_trait]
pub trait IdAuthority: Send + Sync {
    /// Allocates the next block of `partition`.
    async fn get_id_block(&self, partition: u32) -> StorageResult<IdBlock>;

    /// Start of the block the next allocation in `partition` would return.
    async fn peek_next_id(&self, partition: u32) -> StorageResult<i64>;

    fn set_id_block_sizer(&self, sizer: Arc<dyn IdBlockSizer>);

    /// Key range this process prefers to allocate in, as reported by the store.
    fn local_id_partition(&self) -> StorageResult<KeyRange>;

    async fn close(&self) -> StorageResult<()>;
}

/// State shared by both allocation strategies.
pub(crate) struct AuthorityCore<M: StoreManager> {
    pub(crate) manager: Arc<M>,
    pub(crate) store: Arc<M::Store>,
    sizer: RwLock<Option<Arc<dyn IdBlockSizer>>>,
    policy: RetryPolicy,
    clock: Arc<dyn LeaseClock>,
    closed: AtomicBool,
}

impl<M: StoreManager> AuthorityCore<M> {
    pub(crate) async fn open(
        manager: Arc<M>,
        config: &KeywardConfig,
        clock: Arc<dyn LeaseClock>,
    ) -> StorageResult<Self> {
        let store = manager.open_database(ID_STORE_NAME).await?;
        let policy = config.id_retry_policy();
        info!(
            store = ID_STORE_NAME,
            retry_count = policy.max_attempts,
            wait_ms = config.ids_wait_ms,
            "Opening id authority"
        );
        Ok(Self {
            manager,
            store,
            sizer: RwLock::new(None),
            policy,
            clock,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::InvalidState("id authority is closed".to_string()));
        }
        Ok(())
    }

    pub(crate) fn set_sizer(&self, sizer: Arc<dyn IdBlockSizer>) {
        *self.sizer.write() = Some(sizer);
    }

    pub(crate) fn block_size(&self, partition: u32) -> StorageResult<i64> {
        let sizer = self.sizer.read().clone().ok_or_else(|| {
            StorageError::IllegalArgument("no id block sizer has been set".to_string())
        })?;
        let size = sizer.block_size(partition);
        if size <= 0 {
            return Err(StorageError::IllegalArgument(format!(
                "block size for partition {} must be positive, got {}",
                partition, size
            )));
        }
        Ok(size)
    }

    /// Runs `op` under the id retry policy, counting retries.
    pub(crate) async fn retrying<T, F, Fut>(&self, operation: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        retry::attempt(operation, &self.policy, self.clock.as_ref(), |attempt| {
            if attempt > 1 {
                counter!("keyward_id_allocation_retries_total").increment(1);
            }
            op()
        })
        .await
    }

    pub(crate) fn allocated(&self, partition: u32, block: IdBlock) -> IdBlock {
        counter!("keyward_id_blocks_allocated_total").increment(1);
        debug!(partition, start = block.start, end = block.end, "Allocated id block");
        block
    }

    pub(crate) fn local_id_partition(&self) -> StorageResult<KeyRange> {
        validate_local_partition(self.store.local_key_partition()?)
    }

    pub(crate) async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(store = ID_STORE_NAME, "Closing id authority");
        self.store.close().await
    }
}
