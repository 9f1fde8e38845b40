//! Transactional lock adapter
//!
//! For stores with isolated multi-key transactions, a lock is nothing more
//! than a read inside the transaction: the locked cell joins the read set and
//! any concurrent writer makes one of the two commits fail with a conflict.
//! The adapter records which cells were locked, checks expected values and
//! reports a conflicting commit of a locking transaction as lock contention.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tracing::debug;

use keyward_common::{
    ConsistencyLevel, Entry, KeyColumnValueStore, KeyRange, SliceQuery, StorageError,
    StorageResult, StoreTransaction,
};

use crate::claim::KeyColumn;

pub struct TransactionalLockTransaction<T> {
    base: T,
    /// (store name, target) pairs locked so far.
    locked: Mutex<BTreeSet<(String, KeyColumn)>>,
}

impl<T: StoreTransaction> TransactionalLockTransaction<T> {
    pub fn new(base: T) -> Self {
        Self {
            base,
            locked: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn base(&self) -> &T {
        &self.base
    }

    pub fn lock_count(&self) -> usize {
        self.locked.lock().len()
    }

    fn holds(&self, store: &str, target: &KeyColumn) -> bool {
        self.locked.lock().contains(&(store.to_string(), target.clone()))
    }
}

#[async_trait]
impl<T: StoreTransaction> StoreTransaction for TransactionalLockTransaction<T> {
    fn consistency(&self) -> ConsistencyLevel {
        self.base.consistency()
    }

    async fn commit(&self) -> StorageResult<()> {
        let result = self.base.commit().await;
        let locked = std::mem::take(&mut *self.locked.lock());

        if let Err(StorageError::Conflict(reason)) = &result
            && let Some((store, target)) = locked.first()
        {
            counter!("keyward_lock_contention_total", "detected" => "remote").increment(1);
            debug!(store = %store, target = %target, reason = %reason, "Lock lost at commit");
            return Err(StorageError::LockContention {
                key: target.key.clone(),
                column: target.column.clone(),
                holder: "a concurrent transaction".to_string(),
            });
        }
        result
    }

    async fn rollback(&self) -> StorageResult<()> {
        let result = self.base.rollback().await;
        self.locked.lock().clear();
        result
    }
}

pub struct TransactionalLockStore<S> {
    store: Arc<S>,
}

impl<S: KeyColumnValueStore> TransactionalLockStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<S: KeyColumnValueStore + 'static> KeyColumnValueStore for TransactionalLockStore<S> {
    type Tx = TransactionalLockTransaction<S::Tx>;

    fn name(&self) -> &str {
        self.store.name()
    }

    async fn get(&self, key: &[u8], column: &[u8], txh: &Self::Tx) -> StorageResult<Option<Bytes>> {
        self.store.get(key, column, txh.base()).await
    }

    async fn get_slice(&self, key: &[u8], query: &SliceQuery, txh: &Self::Tx) -> StorageResult<Vec<Entry>> {
        self.store.get_slice(key, query, txh.base()).await
    }

    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()> {
        self.store.mutate(key, additions, deletions, txh.base()).await
    }

    async fn conditional_write(
        &self,
        key: &[u8],
        column: &[u8],
        new_value: Option<Bytes>,
        expected: Option<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()> {
        self.store
            .conditional_write(key, column, new_value, expected, txh.base())
            .await
    }

    async fn acquire_lock(
        &self,
        key: &[u8],
        column: &[u8],
        expected: Option<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()> {
        let target = KeyColumn::new(Bytes::copy_from_slice(key), Bytes::copy_from_slice(column));
        if txh.holds(self.name(), &target) {
            return Ok(());
        }

        let current = self.store.get(key, column, txh.base()).await?;
        if let Some(expected) = expected
            && current.as_ref() != Some(&expected)
        {
            debug!(store = self.name(), target = %target, "Locked cell does not hold the expected value");
            return Err(StorageError::ExpectationViolated {
                key: target.key,
                column: target.column,
            });
        }

        debug!(store = self.name(), target = %target, "Added cell to transaction lock set");
        txh.locked.lock().insert((self.name().to_string(), target));
        Ok(())
    }

    fn local_key_partition(&self) -> StorageResult<KeyRange> {
        self.store.local_key_partition()
    }

    async fn close(&self) -> StorageResult<()> {
        self.store.close().await
    }
}
