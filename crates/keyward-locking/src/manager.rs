//! Lock-bearing store factory
//!
//! [`LockingStoreManager`] wraps any [`StoreManager`] and hands out stores
//! whose `acquire_lock` works, choosing the locking strategy from the
//! backend's capability flags:
//!
//! | capability                    | strategy                         |
//! |-------------------------------|----------------------------------|
//! | native locking                | stores used as they are          |
//! | transactions                  | [`TransactionalLockStore`]       |
//! | consistent-key operations     | [`ConsistentKeyLockStore`]       |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use keyward_common::{
    ConsistencyLevel, Entry, KeyColumnValueStore, KeyRange, KeywardConfig, SliceQuery,
    StorageError, StorageResult, StoreFeatures, StoreManager, StoreTransaction,
};

use crate::claim::Claimant;
use crate::consistent_key::{
    ConsistentKeyLockConfig, ConsistentKeyLockStore, ConsistentKeyLockTransaction, lock_store_name,
};
use crate::mediator::LocalLockMediators;
use crate::transactional::{TransactionalLockStore, TransactionalLockTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    Native,
    Transactional,
    ConsistentKey,
}

impl LockStrategy {
    /// Strategy for a backend, preferring native locking, then transactions.
    pub fn for_features(features: StoreFeatures) -> StorageResult<Self> {
        if features.supports_native_locking {
            Ok(Self::Native)
        } else if features.supports_transactions {
            Ok(Self::Transactional)
        } else if features.supports_consistent_key_operations {
            Ok(Self::ConsistentKey)
        } else {
            Err(StorageError::Unsupported(
                "backend offers neither native locking, transactions nor consistent-key operations"
                    .to_string(),
            ))
        }
    }
}

/// Store opened through a [`LockingStoreManager`].
pub enum LockingStore<S: KeyColumnValueStore> {
    Native(Arc<S>),
    Transactional(TransactionalLockStore<S>),
    ConsistentKey(ConsistentKeyLockStore<S>),
}

/// Transaction opened through a [`LockingStoreManager`].
pub enum LockingTransaction<S: KeyColumnValueStore> {
    Native(S::Tx),
    Transactional(TransactionalLockTransaction<S::Tx>),
    ConsistentKey(ConsistentKeyLockTransaction<S>),
}

impl<S: KeyColumnValueStore> LockingTransaction<S> {
    pub fn strategy(&self) -> LockStrategy {
        match self {
            Self::Native(_) => LockStrategy::Native,
            Self::Transactional(_) => LockStrategy::Transactional,
            Self::ConsistentKey(_) => LockStrategy::ConsistentKey,
        }
    }
}

pub struct LockingStoreManager<M: StoreManager> {
    manager: Arc<M>,
    strategy: LockStrategy,
    mediators: Arc<LocalLockMediators>,
    mediator_prefix: String,
    instance_id: Bytes,
    lock_config: ConsistentKeyLockConfig,
    next_token: AtomicU64,
}

impl<M: StoreManager> LockingStoreManager<M> {
    pub fn new(manager: Arc<M>, config: &KeywardConfig, mediators: Arc<LocalLockMediators>) -> StorageResult<Self> {
        let strategy = LockStrategy::for_features(manager.features())?;
        info!(
            ?strategy,
            instance = %config.instance_id,
            mediator_prefix = %config.local_lock_mediator_prefix,
            "Opening locking store manager"
        );
        Ok(Self {
            manager,
            strategy,
            mediators,
            mediator_prefix: config.local_lock_mediator_prefix.clone(),
            instance_id: Bytes::from(config.instance_id.clone().into_bytes()),
            lock_config: ConsistentKeyLockConfig::from_config(config),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    pub fn inner(&self) -> &Arc<M> {
        &self.manager
    }

    fn next_claimant(&self) -> Claimant {
        Claimant::new(self.instance_id.clone(), self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl<M: StoreManager + 'static> StoreManager for LockingStoreManager<M> {
    type Tx = LockingTransaction<M::Store>;
    type Store = LockingStore<M::Store>;

    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            supports_native_locking: true,
            ..self.manager.features()
        }
    }

    async fn open_database(&self, name: &str) -> StorageResult<Arc<Self::Store>> {
        let data = self.manager.open_database(name).await?;
        let store = match self.strategy {
            LockStrategy::Native => LockingStore::Native(data),
            LockStrategy::Transactional => LockingStore::Transactional(TransactionalLockStore::new(data)),
            LockStrategy::ConsistentKey => {
                let locks = self.manager.open_database(&lock_store_name(name)).await?;
                LockingStore::ConsistentKey(ConsistentKeyLockStore::new(
                    data,
                    locks,
                    &self.mediators,
                    &self.mediator_prefix,
                    self.lock_config,
                ))
            }
        };
        Ok(Arc::new(store))
    }

    async fn begin_transaction(&self, level: ConsistencyLevel) -> StorageResult<Self::Tx> {
        let base = self.manager.begin_transaction(level).await?;
        Ok(match self.strategy {
            LockStrategy::Native => LockingTransaction::Native(base),
            LockStrategy::Transactional => LockingTransaction::Transactional(TransactionalLockTransaction::new(base)),
            LockStrategy::ConsistentKey => {
                let lock_tx = self.manager.begin_transaction(ConsistencyLevel::KeyConsistent).await?;
                LockingTransaction::ConsistentKey(ConsistentKeyLockTransaction::new(
                    base,
                    lock_tx,
                    self.next_claimant(),
                ))
            }
        })
    }

    async fn clear_storage(&self) -> StorageResult<()> {
        self.manager.clear_storage().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.manager.close().await
    }
}

#[async_trait]
impl<S: KeyColumnValueStore + 'static> StoreTransaction for LockingTransaction<S> {
    fn consistency(&self) -> ConsistencyLevel {
        match self {
            Self::Native(tx) => tx.consistency(),
            Self::Transactional(tx) => tx.consistency(),
            Self::ConsistentKey(tx) => tx.consistency(),
        }
    }

    async fn commit(&self) -> StorageResult<()> {
        match self {
            Self::Native(tx) => tx.commit().await,
            Self::Transactional(tx) => tx.commit().await,
            Self::ConsistentKey(tx) => tx.commit().await,
        }
    }

    async fn rollback(&self) -> StorageResult<()> {
        match self {
            Self::Native(tx) => tx.rollback().await,
            Self::Transactional(tx) => tx.rollback().await,
            Self::ConsistentKey(tx) => tx.rollback().await,
        }
    }
}

fn strategy_mismatch(store: &str, tx: LockStrategy) -> StorageError {
    StorageError::InvalidState(format!(
        "store '{}' cannot be used with a {:?} locking transaction",
        store, tx
    ))
}

/// Dispatches a store call to the matching (store, transaction) variants.
macro_rules! dispatch {
    ($self:ident, $txh:ident, |$store:ident, $tx:ident| $call:expr) => {
        match ($self, $txh) {
            (LockingStore::Native($store), LockingTransaction::Native($tx)) => $call,
            (LockingStore::Transactional($store), LockingTransaction::Transactional($tx)) => $call,
            (LockingStore::ConsistentKey($store), LockingTransaction::ConsistentKey($tx)) => $call,
            (store, tx) => Err(strategy_mismatch(store.name(), tx.strategy())),
        }
    };
}

#[async_trait]
impl<S: KeyColumnValueStore + 'static> KeyColumnValueStore for LockingStore<S> {
    type Tx = LockingTransaction<S>;

    fn name(&self) -> &str {
        match self {
            Self::Native(store) => store.name(),
            Self::Transactional(store) => store.name(),
            Self::ConsistentKey(store) => store.name(),
        }
    }

    async fn get(&self, key: &[u8], column: &[u8], txh: &Self::Tx) -> StorageResult<Option<Bytes>> {
        dispatch!(self, txh, |store, tx| store.get(key, column, tx).await)
    }

    async fn get_slice(&self, key: &[u8], query: &SliceQuery, txh: &Self::Tx) -> StorageResult<Vec<Entry>> {
        dispatch!(self, txh, |store, tx| store.get_slice(key, query, tx).await)
    }

    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()> {
        dispatch!(self, txh, |store, tx| store.mutate(key, additions, deletions, tx).await)
    }

    async fn conditional_write(
        &self,
        key: &[u8],
        column: &[u8],
        new_value: Option<Bytes>,
        expected: Option<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()> {
        dispatch!(self, txh, |store, tx| store
            .conditional_write(key, column, new_value, expected, tx)
            .await)
    }

    async fn acquire_lock(
        &self,
        key: &[u8],
        column: &[u8],
        expected: Option<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()> {
        dispatch!(self, txh, |store, tx| store.acquire_lock(key, column, expected, tx).await)
    }

    fn local_key_partition(&self) -> StorageResult<KeyRange> {
        match self {
            Self::Native(store) => store.local_key_partition(),
            Self::Transactional(store) => store.local_key_partition(),
            Self::ConsistentKey(store) => store.local_key_partition(),
        }
    }

    async fn close(&self) -> StorageResult<()> {
        match self {
            Self::Native(store) => store.close().await,
            Self::Transactional(store) => store.close().await,
            Self::ConsistentKey(store) => store.close().await,
        }
    }
}
