//! Capability-driven ID authority factory

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use keyward_common::{
    KeyRange, KeywardConfig, LeaseClock, StorageError, StorageResult, StoreFeatures, StoreManager,
};

use crate::authority::{IdAuthority, IdBlock, IdBlockSizer};
use crate::consistent_key::ConsistentKeyIdManager;
use crate::transactional::TransactionalIdManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    Transactional,
    ConsistentKey,
}

impl IdStrategy {
    /// Native transactions win over consistent-key operations.
    pub fn for_features(features: StoreFeatures) -> StorageResult<Self> {
        if features.supports_transactions {
            Ok(Self::Transactional)
        } else if features.supports_consistent_key_operations {
            Ok(Self::ConsistentKey)
        } else {
            Err(StorageError::Unsupported(
                "id allocation needs transactions or consistent-key operations".to_string(),
            ))
        }
    }
}

/// ID authority over whichever strategy the backend supports.
pub enum IdManager<M: StoreManager> {
    Transactional(TransactionalIdManager<M>),
    ConsistentKey(ConsistentKeyIdManager<M>),
}

impl<M: StoreManager + 'static> IdManager<M> {
    pub async fn open(manager: Arc<M>, config: &KeywardConfig, clock: Arc<dyn LeaseClock>) -> StorageResult<Self> {
        let strategy = IdStrategy::for_features(manager.features())?;
        info!(?strategy, "Selected id allocation strategy");
        Ok(match strategy {
            IdStrategy::Transactional => {
                Self::Transactional(TransactionalIdManager::open(manager, config, clock).await?)
            }
            IdStrategy::ConsistentKey => {
                Self::ConsistentKey(ConsistentKeyIdManager::open(manager, config, clock).await?)
            }
        })
    }

    pub fn strategy(&self) -> IdStrategy {
        match self {
            Self::Transactional(_) => IdStrategy::Transactional,
            Self::ConsistentKey(_) => IdStrategy::ConsistentKey,
        }
    }

    fn authority(&self) -> &dyn IdAuthority {
        match self {
            Self::Transactional(ids) => ids,
            Self::ConsistentKey(ids) => ids,
        }
    }
}

#[async_trait]
impl<M: StoreManager + 'static> IdAuthority for IdManager<M> {
    async fn get_id_block(&self, partition: u32) -> StorageResult<IdBlock> {
        self.authority().get_id_block(partition).await
    }

    async fn peek_next_id(&self, partition: u32) -> StorageResult<i64> {
        self.authority().peek_next_id(partition).await
    }

    fn set_id_block_sizer(&self, sizer: Arc<dyn IdBlockSizer>) {
        self.authority().set_id_block_sizer(sizer)
    }

    fn local_id_partition(&self) -> StorageResult<KeyRange> {
        self.authority().local_id_partition()
    }

    async fn close(&self) -> StorageResult<()> {
        self.authority().close().await
    }
}
