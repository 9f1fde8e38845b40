//! Consistent-key lock adapter
//!
//! Adds `acquire_lock` to a store that only offers per-key atomic
//! operations. A lock attempt first goes through the process-local
//! [`LocalLockMediator`], then writes a timestamped claim into the companion
//! lock database. Claims are verified lazily: the first mutation after the
//! claim waits until the claim is `lock_wait` old, reads every claim on the
//! target and proceeds only if its own claim is the earliest live one.

mod transaction;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use keyward_common::constants::LOCK_STORE_SUFFIX;
use keyward_common::retry::{self, Backoff, RetryPolicy};
use keyward_common::{
    Entry, KeyColumnValueStore, KeyRange, KeywardConfig, LeaseClock, SliceQuery, StorageError,
    StorageResult,
};

use crate::claim::{ClaimRecord, KeyColumn, LockClaim, winning_claim};
use crate::mediator::{LocalLockMediator, LocalLockMediators};

pub use transaction::ConsistentKeyLockTransaction;

/// Timing of the claim protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistentKeyLockConfig {
    /// Claim lifetime measured from its timestamp.
    pub lock_expire: Duration,
    /// Settling time before a claim is verified. A claim write that takes
    /// longer than this is withdrawn and retried.
    pub lock_wait: Duration,
    /// Attempts for one claim write.
    pub lock_retry_count: u32,
}

impl ConsistentKeyLockConfig {
    pub fn from_config(config: &KeywardConfig) -> Self {
        Self {
            lock_expire: config.lock_expire(),
            lock_wait: config.lock_wait(),
            lock_retry_count: config.lock_retry_count,
        }
    }

    fn expire_ms(&self) -> i64 {
        i64::try_from(self.lock_expire.as_millis()).unwrap_or(i64::MAX)
    }

    fn wait_ms(&self) -> i64 {
        i64::try_from(self.lock_wait.as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for ConsistentKeyLockConfig {
    fn default() -> Self {
        Self::from_config(&KeywardConfig::default())
    }
}

/// Name of the lock database paired with data database `name`.
pub fn lock_store_name(name: &str) -> String {
    format!("{}{}", name, LOCK_STORE_SUFFIX)
}

pub struct ConsistentKeyLockStore<S: KeyColumnValueStore> {
    data: Arc<S>,
    locks: Arc<S>,
    mediator: Arc<LocalLockMediator>,
    clock: Arc<dyn LeaseClock>,
    config: ConsistentKeyLockConfig,
}

impl<S: KeyColumnValueStore + 'static> ConsistentKeyLockStore<S> {
    /// Pairs `data` with its lock database. The local mediator is looked up
    /// as `<mediator_prefix>:<lock database name>`, so only stores sharing a
    /// prefix mediate with each other.
    pub fn new(
        data: Arc<S>,
        locks: Arc<S>,
        mediators: &LocalLockMediators,
        mediator_prefix: &str,
        config: ConsistentKeyLockConfig,
    ) -> Self {
        let mediator = mediators.get(&format!("{}:{}", mediator_prefix, locks.name()));
        Self {
            data,
            locks,
            mediator,
            clock: mediators.clock().clone(),
            config,
        }
    }

    pub fn data_store(&self) -> &Arc<S> {
        &self.data
    }

    pub fn lock_store(&self) -> &Arc<S> {
        &self.locks
    }

    pub fn mediator(&self) -> &Arc<LocalLockMediator> {
        &self.mediator
    }

    /// Writes a fresh claim for `txh`, retrying transient failures and claim
    /// writes slower than `lock_wait`.
    async fn write_claim(
        &self,
        target: &KeyColumn,
        txh: &ConsistentKeyLockTransaction<S>,
    ) -> StorageResult<ClaimRecord> {
        let row = target.lock_row();
        let policy = RetryPolicy::new(self.config.lock_retry_count, Backoff::None);
        let wait_ms = self.config.wait_ms();

        let locks = self.locks.as_ref();
        let clock = self.clock.as_ref();
        let row = &row;

        retry::attempt("lock claim write", &policy, clock, move |_| async move {
            let record = ClaimRecord::new(clock.now_ms(), txh.claimant().clone());
            let column = record.to_column();
            locks
                .conditional_write(row, &column, Some(Bytes::new()), None, txh.lock_tx())
                .await?;

            let elapsed = clock.now_ms() - record.timestamp_ms;
            if elapsed > wait_ms {
                if let Err(e) = locks
                    .conditional_write(row, &column, None, Some(Bytes::new()), txh.lock_tx())
                    .await
                {
                    warn!(error = %e, "Failed to withdraw slow lock claim");
                }
                return Err(StorageError::Unavailable(format!(
                    "lock claim write took {}ms, more than the {}ms lock wait",
                    elapsed, wait_ms
                )));
            }
            Ok(record)
        })
        .await
    }

    /// Confirms every unverified claim `txh` holds on this store. Fails as
    /// soon as any claim of `txh` on this store, verified earlier or not, has
    /// outlived its lease.
    async fn verify_claims(&self, txh: &ConsistentKeyLockTransaction<S>) -> StorageResult<()> {
        if let Some(target) = txh.expired_claim(self.locks.name(), self.clock.now_ms()) {
            return Err(self.contention(&target, "its own claim expired", "local"));
        }
        for claim in txh.unverified_claims(self.locks.name()) {
            self.verify_claim(&claim, txh).await?;
            txh.mark_verified(self.locks.name(), &claim.target);
        }
        Ok(())
    }

    async fn verify_claim(
        &self,
        claim: &LockClaim,
        txh: &ConsistentKeyLockTransaction<S>,
    ) -> StorageResult<()> {
        let target = &claim.target;
        self.clock
            .sleep_until(claim.record.timestamp_ms.saturating_add(self.config.wait_ms()))
            .await;

        let now = self.clock.now_ms();
        if claim.expires_at_ms <= now {
            return Err(self.contention(target, "its own claim expired before verification", "local"));
        }

        let entries = self
            .locks
            .get_slice(&target.lock_row(), &SliceQuery::all(), txh.lock_tx())
            .await?;
        let records = entries
            .iter()
            .map(|entry| ClaimRecord::from_column(&entry.column))
            .collect::<StorageResult<Vec<_>>>()?;

        match winning_claim(&records, now, self.config.expire_ms()) {
            Some(winner) if *winner == claim.record => {}
            Some(winner) => {
                let holder = winner.claimant.to_string();
                return Err(self.contention(target, &holder, "remote"));
            }
            None => {
                return Err(self.contention(target, "nobody, its own claim is missing", "remote"));
            }
        }

        if let Some(expected) = &claim.expected {
            let actual = self.data.get(&target.key, &target.column, txh.lock_tx()).await?;
            if actual.as_ref() != Some(expected) {
                debug!(target = %target, "Locked cell does not hold the expected value");
                return Err(StorageError::ExpectationViolated {
                    key: target.key.clone(),
                    column: target.column.clone(),
                });
            }
        }

        debug!(
            store = self.locks.name(),
            target = %target,
            claimant = %txh.claimant(),
            "Verified lock claim"
        );
        Ok(())
    }

    fn contention(&self, target: &KeyColumn, holder: &str, detected: &'static str) -> StorageError {
        counter!("keyward_lock_contention_total", "detected" => detected).increment(1);
        debug!(store = self.locks.name(), target = %target, holder, detected, "Lock contention");
        StorageError::LockContention {
            key: target.key.clone(),
            column: target.column.clone(),
            holder: holder.to_string(),
        }
    }
}

#[async_trait]
impl<S: KeyColumnValueStore + 'static> KeyColumnValueStore for ConsistentKeyLockStore<S> {
    type Tx = ConsistentKeyLockTransaction<S>;

    fn name(&self) -> &str {
        self.data.name()
    }

    async fn get(&self, key: &[u8], column: &[u8], txh: &Self::Tx) -> StorageResult<Option<Bytes>> {
        self.data.get(key, column, txh.base()).await
    }

    async fn get_slice(&self, key: &[u8], query: &SliceQuery, txh: &Self::Tx) -> StorageResult<Vec<Entry>> {
        self.data.get_slice(key, query, txh.base()).await
    }

    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()> {
        self.verify_claims(txh).await?;
        self.data.mutate(key, additions, deletions, txh.base()).await
    }

    async fn conditional_write(
        &self,
        key: &[u8],
        column: &[u8],
        new_value: Option<Bytes>,
        expected: Option<Bytes>,
        txh: &Self::Tx,
    ) -> StorageResult<()> {
        self.verify_claims(txh).await?;
        self.data
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
        if txh.holds(self.locks.name(), &target) {
            debug!(target = %target, claimant = %txh.claimant(), "Lock already held by transaction");
            return Ok(());
        }

        let expires_at_ms = self.clock.now_ms().saturating_add(self.config.expire_ms());
        if !self.mediator.lock(&target, txh.claimant(), expires_at_ms) {
            let holder = self
                .mediator
                .holder(&target)
                .map(|(claimant, _)| claimant.to_string())
                .unwrap_or_default();
            return Err(self.contention(&target, &holder, "local"));
        }

        match self.write_claim(&target, txh).await {
            Ok(record) => {
                debug!(
                    store = self.locks.name(),
                    target = %target,
                    claimant = %txh.claimant(),
                    timestamp_ms = record.timestamp_ms,
                    "Wrote lock claim"
                );
                let claim = LockClaim::new(target, record, self.config.expire_ms(), expected);
                txh.record_claim(claim, self.locks.clone(), self.mediator.clone());
                Ok(())
            }
            Err(e) => {
                self.mediator.unlock(&target, txh.claimant());
                Err(e)
            }
        }
    }

    fn local_key_partition(&self) -> StorageResult<KeyRange> {
        self.data.local_key_partition()
    }

    async fn close(&self) -> StorageResult<()> {
        self.data.close().await?;
        self.locks.close().await
    }
}
