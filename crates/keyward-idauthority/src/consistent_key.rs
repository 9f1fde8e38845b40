// ID allocation over per-key atomic operations
// Without transactions the increment is a compare-and-set: the new counter is
// written only if the cell still holds the raw value that was read. A lost
// race surfaces as a conflict and is retried like a failed commit.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use keyward_common::{
    ConsistencyLevel, KeyColumnValueStore, KeyRange, KeywardConfig, LeaseClock, StorageResult,
    StoreManager, StoreTransaction,
};

use crate::authority::{AuthorityCore, IdAuthority, IdBlock, IdBlockSizer};
use crate::codec::{COUNTER_COLUMN, decode_counter, encode_counter, next_block, partition_key};

pub struct ConsistentKeyIdManager<M: StoreManager> {
    core: AuthorityCore<M>,
}

impl<M: StoreManager> ConsistentKeyIdManager<M> {
    pub async fn open(manager: Arc<M>, config: &KeywardConfig, clock: Arc<dyn LeaseClock>) -> StorageResult<Self> {
        Ok(Self {
            core: AuthorityCore::open(manager, config, clock).await?,
        })
    }

    async fn allocate_once(&self, partition: u32, key: &Bytes, block_size: i64) -> StorageResult<IdBlock> {
        let tx = self
            .core
            .manager
            .begin_transaction(ConsistencyLevel::KeyConsistent)
            .await?;
        let result: StorageResult<IdBlock> = async {
            let raw = self.core.store.get(key, COUNTER_COLUMN, &tx).await?;
            let block = next_block(partition, decode_counter(partition, raw.as_ref())?, block_size)?;
            self.core
                .store
                .conditional_write(key, COUNTER_COLUMN, Some(encode_counter(block.end)), raw, &tx)
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
        let tx = self
            .core
            .manager
            .begin_transaction(ConsistencyLevel::KeyConsistent)
            .await?;
        let result = self.core.store.get(key, COUNTER_COLUMN, &tx).await;
        if let Err(e) = tx.rollback().await {
            debug!(partition, error = %e, "Rollback of read-only transaction failed");
        }
        decode_counter(partition, result?.as_ref())
    }
}

#[async_trait]
impl<M: StoreManager + 'static> IdAuthority for ConsistentKeyIdManager<M> {
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
    use keyward_common::{ConsistencyLevel, ManualClock, StorageError};
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

    async fn open(storage: Arc<InMemoryStorage>) -> (Arc<InMemoryStoreManager>, ConsistentKeyIdManager<InMemoryStoreManager>) {
        let manager = Arc::new(InMemoryStoreManager::consistent_key(storage));
        let ids = ConsistentKeyIdManager::open(manager.clone(), &config(), ManualClock::shared(0))
            .await
            .unwrap();
        (manager, ids)
    }

    #[tokio::test]
    async fn test_sequential_blocks() {
        let (_manager, ids) = open(InMemoryStorage::new()).await;
        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(400)));

        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(1, 401));
        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(401, 801));
        assert_eq!(ids.peek_next_id(0).await.unwrap(), 801);
    }

    #[tokio::test]
    async fn test_sizer_is_read_per_allocation() {
        let (_manager, ids) = open(InMemoryStorage::new()).await;
        ids.set_id_block_sizer(Arc::new(|partition: u32| if partition == 0 { 10 } else { 20 }));

        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(1, 11));
        assert_eq!(ids.get_id_block(1).await.unwrap(), IdBlock::new(1, 21));

        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(5)));
        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(11, 16));
    }

    #[tokio::test]
    async fn test_counter_moved_by_another_host() {
        let storage = InMemoryStorage::new();
        let (manager, ids) = open(storage.clone()).await;
        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(100)));
        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(1, 101));

        // Another host moves the counter behind our back
        let store = manager.open_database("ids").await.unwrap();
        let tx = manager
            .begin_transaction(ConsistencyLevel::KeyConsistent)
            .await
            .unwrap();
        store
            .conditional_write(
                &partition_key(0),
                COUNTER_COLUMN,
                Some(encode_counter(501)),
                Some(encode_counter(101)),
                &tx,
            )
            .await
            .unwrap();

        assert_eq!(ids.get_id_block(0).await.unwrap(), IdBlock::new(501, 601));
    }

    #[tokio::test]
    async fn test_corrupted_counter_is_permanent() {
        let (manager, ids) = open(InMemoryStorage::new()).await;
        ids.set_id_block_sizer(Arc::new(FixedBlockSizer(100)));

        let store = manager.open_database("ids").await.unwrap();
        let tx = manager
            .begin_transaction(ConsistencyLevel::KeyConsistent)
            .await
            .unwrap();
        store
            .conditional_write(
                &partition_key(0),
                COUNTER_COLUMN,
                Some(Bytes::from_static(b"bad")),
                None,
                &tx,
            )
            .await
            .unwrap();

        assert!(matches!(
            ids.get_id_block(0).await,
            Err(StorageError::CorruptedData { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_id_partition() {
        let storage = InMemoryStorage::new();
        let (_manager, ids) = open(storage.clone()).await;
        assert!(matches!(
            ids.local_id_partition(),
            Err(StorageError::Unsupported(_))
        ));

        let partitioned = Arc::new(
            InMemoryStoreManager::consistent_key(storage)
                .with_local_key_partition(KeyRange::new(vec![0u8, 0, 0, 0], vec![0x40u8, 0, 0, 0])),
        );
        let ids = ConsistentKeyIdManager::open(partitioned, &config(), ManualClock::shared(0))
            .await
            .unwrap();
        let range = ids.local_id_partition().unwrap();
        assert_eq!(range.low.as_ref(), &[0, 0, 0, 0]);
        assert_eq!(range.high.as_ref(), &[0x40, 0, 0, 0]);
    }
}
