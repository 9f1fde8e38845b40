// Transaction handle of the consistent-key lock adapter
// Wraps the caller's base transaction with a key-consistent transaction used
// for every lock database access, and tracks the claims it holds so they can
// be released when the transaction finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use keyward_common::{ConsistencyLevel, KeyColumnValueStore, StorageResult, StoreTransaction};

use crate::claim::{Claimant, KeyColumn, LockClaim};
use crate::mediator::LocalLockMediator;

struct HeldClaim<S> {
    claim: LockClaim,
    lock_store: Arc<S>,
    mediator: Arc<LocalLockMediator>,
}

impl<S: KeyColumnValueStore> HeldClaim<S> {
    fn is_for(&self, lock_store: &str, target: &KeyColumn) -> bool {
        self.lock_store.name() == lock_store && self.claim.target == *target
    }
}

pub struct ConsistentKeyLockTransaction<S: KeyColumnValueStore> {
    base: S::Tx,
    lock_tx: S::Tx,
    claimant: Claimant,
    claims: Mutex<Vec<HeldClaim<S>>>,
    lock_tx_finished: AtomicBool,
}

impl<S: KeyColumnValueStore> ConsistentKeyLockTransaction<S> {
    pub fn new(base: S::Tx, lock_tx: S::Tx, claimant: Claimant) -> Self {
        Self {
            base,
            lock_tx,
            claimant,
            claims: Mutex::new(Vec::new()),
            lock_tx_finished: AtomicBool::new(false),
        }
    }

    pub fn claimant(&self) -> &Claimant {
        &self.claimant
    }

    /// Transaction data operations are forwarded with.
    pub fn base(&self) -> &S::Tx {
        &self.base
    }

    /// Key-consistent transaction used for claim records and verification reads.
    pub fn lock_tx(&self) -> &S::Tx {
        &self.lock_tx
    }

    /// Number of claims currently held.
    pub fn claim_count(&self) -> usize {
        self.claims.lock().len()
    }

    pub(crate) fn holds(&self, lock_store: &str, target: &KeyColumn) -> bool {
        self.claims
            .lock()
            .iter()
            .any(|held| held.is_for(lock_store, target))
    }

    pub(crate) fn record_claim(&self, claim: LockClaim, lock_store: Arc<S>, mediator: Arc<LocalLockMediator>) {
        self.claims.lock().push(HeldClaim {
            claim,
            lock_store,
            mediator,
        });
    }

    /// Claims on `lock_store` not verified yet, in acquisition order.
    pub(crate) fn unverified_claims(&self, lock_store: &str) -> Vec<LockClaim> {
        self.claims
            .lock()
            .iter()
            .filter(|held| held.lock_store.name() == lock_store && !held.claim.verified)
            .map(|held| held.claim.clone())
            .collect()
    }

    /// A claim on `lock_store` whose lease ended by `now_ms`, verified or not.
    pub(crate) fn expired_claim(&self, lock_store: &str, now_ms: i64) -> Option<KeyColumn> {
        self.claims
            .lock()
            .iter()
            .find(|held| held.lock_store.name() == lock_store && held.claim.expires_at_ms <= now_ms)
            .map(|held| held.claim.target.clone())
    }

    pub(crate) fn mark_verified(&self, lock_store: &str, target: &KeyColumn) {
        if let Some(held) = self
            .claims
            .lock()
            .iter_mut()
            .find(|held| held.is_for(lock_store, target))
        {
            held.claim.verified = true;
        }
    }

    /// Deletes every claim record and local registration of this transaction.
    /// Failures are logged; the claims then linger until they expire.
    async fn release_claims(&self) {
        let held = std::mem::take(&mut *self.claims.lock());
        for HeldClaim {
            claim,
            lock_store,
            mediator,
        } in held
        {
            let row = claim.target.lock_row();
            let column = claim.record.to_column();
            if let Err(e) = lock_store
                .conditional_write(&row, &column, None, Some(Bytes::new()), &self.lock_tx)
                .await
            {
                warn!(
                    store = lock_store.name(),
                    target = %claim.target,
                    claimant = %self.claimant,
                    error = %e,
                    "Failed to delete lock claim, it will expire on its own"
                );
            }
            mediator.unlock(&claim.target, &self.claimant);
            debug!(
                store = lock_store.name(),
                target = %claim.target,
                claimant = %self.claimant,
                "Released lock claim"
            );
        }
    }

    async fn finish_lock_tx(&self, commit: bool) {
        if self.lock_tx_finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = if commit {
            self.lock_tx.commit().await
        } else {
            self.lock_tx.rollback().await
        };
        if let Err(e) = result {
            warn!(claimant = %self.claimant, error = %e, "Failed to finish lock transaction");
        }
    }
}

#[async_trait]
impl<S: KeyColumnValueStore + 'static> StoreTransaction for ConsistentKeyLockTransaction<S> {
    fn consistency(&self) -> ConsistencyLevel {
        self.base.consistency()
    }

    async fn commit(&self) -> StorageResult<()> {
        let result = self.base.commit().await;
        self.release_claims().await;
        self.finish_lock_tx(true).await;
        result
    }

    async fn rollback(&self) -> StorageResult<()> {
        let result = self.base.rollback().await;
        self.release_claims().await;
        self.finish_lock_tx(false).await;
        result
    }
}
