// ID allocation inside native store transactions
// Each attempt reads the counter, writes the incremented value and commits in
// one transaction; the store's isolation turns racing allocations into commit
// conflicts, which the retry loop absorbs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use keyward_common::{
    ConsistencyLevel, Entry, KeyColumnValueStore, KeyRange, KeywardConfig, LeaseClock,
    StorageResult, StoreManager, StoreTransaction,
};

use crate::authority::{AuthorityCore, IdAuthority, IdBlock, IdBlockSizer};
use crate::codec::{COUNTER_COLUMN, decode_counter, encode_counter, next_block, partition_key};

pub struct TransactionalIdManager<M: StoreManager> {
    core: AuthorityCore<M>,
}

impl<M: StoreManager> TransactionalIdManager<M> {
    pub async fn open(manager: Arc<M>, config: &KeywardConfig, clock: Arc<dyn LeaseClock>) -> StorageResult<Self> {
        Ok(Self {
            core: AuthorityCore::open(manager, config, clock).await?,
        })
    }

    async fn allocate_once(&self, partition: u32, key: &Bytes, block_size: i64) -> StorageResult<IdBlock> {
        let tx = self.core.manager.begin_transaction(ConsistencyLevel::Default).await?;
        let result: StorageResult<IdBlock> = async {
            let current = self.core.store.get(key, COUNTER_COLUMN, &tx).await?;
            let block = next_block(partition, decode_counter(partition, current.as_ref())?, block_size)?;
            self.core
                .store
                .mutate(
                    key,
                    vec![Entry::new(Bytes::from_static(COUNTER_COLUMN), encode_counter(block.end))],
                    vec![],
                    &tx,
                )
                .await?;
            tx.commit().await?;
            Ok(block)
        }
        .await;

        if let Err(e) = &result {
            debug!(partition, error = %e, "Id allocation attempt failed, rolling back");
            if let Err(rollback) = tx.rollback().await {
                debug!(partition, error = %rollback, "Rollback after failed allocation failed");
            }
        }
        result
    }

    async fn read_once(&self, partition: u32, key: &Bytes) -> StorageResult<i64> {
        let tx = self.core.manager.begin_transaction(ConsistencyLevel::Default).await?;
        let result = self.core.store.get(key, COUNTER_COLUMN, &tx).await;
        if let Err(e) = tx.rollback().await {
            debug!(partition, error = %e, "Rollback of read-only transaction failed");
        }
        decode_counter(partition, result?.as_ref())
    }
}

#[async_trait]
impl<M: StoreManager + 'static> IdAuthority for TransactionalIdManager<M> {
    async fn get_id_block(&self, partition: u32) -> StorageResult<IdBlock> {
        self.core.ensure_open()?;
        let block_size = self.core.block_size(partition)?;
        let key = &partition_key(partition);

        let block = self
            .core
            .retrying("id block allocation", move || self.allocate_once(partition, key, block_size))
            .await?;
        Ok(self.core.allocated(partition, block))
    }

    async fn peek_next_id(&self, partition: u32) -> StorageResult<i64> {
        self.core.ensure_open()?;
        let key = &partition_key(partition);
        self.core
            .retrying("id counter read", move || self.read_once(partition, key))
            .await
    }

    fn set_id_block_sizer(&self, sizer: Arc<dyn IdBlockSizer>) {
        self.core.set_sizer(sizer);
    }

    fn local_id_partition(&self) -> StorageResult<KeyRange> {
        self.core.local_id_partition()
    }

    async fn close(&self) -> StorageResult<()> {
        self.core.close().await
    }
}

#[cfg(test)]
mod tests {
    use keyward_common::{ManualClock, StorageError};
    use keyward_storage::{InMemoryStorage, InMemoryStoreManager};

    use super::*;
    use crate::authority::FixedBlockSizer;

    fn config() -> KeywardConfig {
        KeywardConfig {
            ids_retry_count: 5,
            ids_wait_ms: 10,
            ..Default::default()
        }
    }

    async fn open(storage: Arc<InMemoryStorage>) -> (Arc<InMemoryStoreManager>, TransactionalIdManager<InMemoryStoreManager>) {
        let manager = Arc::new(InMemoryStoreManager::transactional(storage));
        let ids = TransactionalIdManager::open(manager.clone(), &config(), ManualClock::shared(0))
            .await
            .unwrap();
        (manager, ids)
    }

    #[tokio::test]
    async fn test_sequential_blocks() {
        let (_manager, ids) = open(InMemoryStorage::new()).await;
        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(400)));

        assert_eq!(ids.peek_next_id(0).await.unwrap(), 1);
        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(1, 401));
        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(401, 801));
        assert_eq!(ids.peek_next_id(0).await.unwrap(), 801);
        // Partitions are independent
        assert_eq!(ids.get_id_block(1).await.unwrap(), IdBlock::new(1, 401));
    }

    #[tokio::test]
    async fn test_missing_sizer_is_illegal() {
        let (_manager, ids) = open(InMemoryStorage::new()).await;
        assert!(matches!(
            ids.get_id_block(0).await,
            Err(StorageError::IllegalArgument(_))
        ));

        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(0)));
        assert!(matches!(
            ids.get_id_block(0).await,
            Err(StorageError::IllegalArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (manager, ids) = open(InMemoryStorage::new()).await;
        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(10)));

        manager.fail_next_operations(3);
        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(1, 11));
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_temporary() {
        let (manager, ids) = open(InMemoryStorage::new()).await;
        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(10)));

        manager.fail_next_operations(100);
        let err = ids.get_id_block(0).await.unwrap_err();
        assert!(matches!(err, StorageError::TemporaryFailure { attempts: 5, .. }));
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn test_overflow_is_not_retried() {
        let (_manager, ids) = open(InMemoryStorage::new()).await;
        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(i64::MAX - 1)));

        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(1, i64::MAX));
        assert!(matches!(
            ids.get_id_block(0).await,
            Err(StorageError::IdOverflow { partition: 0, .. })
        ));
        // The failed attempt left the counter untouched
        assert_eq!(ids.peek_next_id(0).await.unwrap(), i64::MAX);
    }

    #[tokio::test]
    async fn test_closed_authority_rejects_calls() {
        let (_manager, ids) = open(InMemoryStorage::new()).await;
        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(10)));
        ids.close().await.unwrap();
        ids.close().await.unwrap();
        assert!(matches!(
            ids.get_id_block(0).await,
            Err(StorageError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_hosts_never_overlap() {
        let storage = InMemoryStorage::new();
        let mut hosts = Vec::new();
        for _ in 0..4 {
            let (_manager, ids) = open(storage.clone()).await;
            ids.set_id_block_sizer(Arc::new(FixedBlockSizer(50)));
            hosts.push(Arc::new(ids));
        }

        let tasks = hosts.iter().map(|ids| {
            let ids = ids.clone();
            async move {
                let mut blocks = Vec::new();
                for _ in 0..25 {
                    blocks.push(ids.get_id_block(0).await.unwrap());
                }
                blocks
            }
        });
        let mut starts: Vec<i64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .map(|block| block.start)
            .collect();
        starts.sort_unstable();

        let expected: Vec<i64> = (0..100).map(|i| 1 + 50 * i).collect();
        assert_eq!(starts, expected);
    }
}
