//! Local lock mediation
//!
//! A [`LocalLockMediator`] tracks which transaction of this process holds
//! each (key, column), so contention between colocated transactions is
//! detected without a store round trip. Mediators are grouped by namespace
//! in a [`LocalLockMediators`] registry; giving two stores different
//! namespaces makes them behave like separate hosts even inside one process.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use keyward_common::LeaseClock;

use crate::claim::{Claimant, KeyColumn};

#[derive(Debug, Clone)]
struct Holder {
    claimant: Claimant,
    expires_at_ms: i64,
}

pub struct LocalLockMediator {
    namespace: String,
    clock: Arc<dyn LeaseClock>,
    locks: DashMap<KeyColumn, Holder>,
}

impl std::fmt::Debug for LocalLockMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLockMediator")
            .field("namespace", &self.namespace)
            .field("held", &self.locks.len())
            .finish()
    }
}

impl LocalLockMediator {
    pub fn new(namespace: impl Into<String>, clock: Arc<dyn LeaseClock>) -> Self {
        Self {
            namespace: namespace.into(),
            clock,
            locks: DashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Registers `claimant` as the holder of `target` until `expires_at_ms`.
    ///
    /// Returns `false` if another claimant holds a live claim. A claimant that
    /// already holds `target` succeeds and keeps its original expiration.
    pub fn lock(&self, target: &KeyColumn, claimant: &Claimant, expires_at_ms: i64) -> bool {
        let now = self.clock.now_ms();
        match self.locks.entry(target.clone()) {
            Entry::Occupied(mut occupied) => {
                let holder = occupied.get();
                if now < holder.expires_at_ms {
                    return holder.claimant == *claimant;
                }
                debug!(
                    namespace = %self.namespace,
                    target = %target,
                    previous = %holder.claimant,
                    "Replacing expired local claim"
                );
                occupied.insert(Holder {
                    claimant: claimant.clone(),
                    expires_at_ms,
                });
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Holder {
                    claimant: claimant.clone(),
                    expires_at_ms,
                });
                true
            }
        }
    }

    /// Removes the claim on `target` if `claimant` owns it.
    pub fn unlock(&self, target: &KeyColumn, claimant: &Claimant) -> bool {
        self.locks
            .remove_if(target, |_, holder| holder.claimant == *claimant)
            .is_some()
    }

    /// Live holder of `target` and its expiration. Expired entries are evicted.
    pub fn holder(&self, target: &KeyColumn) -> Option<(Claimant, i64)> {
        let now = self.clock.now_ms();
        if self
            .locks
            .remove_if(target, |_, holder| holder.expires_at_ms <= now)
            .is_some()
        {
            return None;
        }
        self.locks
            .get(target)
            .map(|holder| (holder.claimant.clone(), holder.expires_at_ms))
    }

    /// Number of registered claims, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Process-wide registry of mediators by namespace
///
/// Created once per process (or per test) and handed to every lock store by
/// reference. [`LocalLockMediators::clear`] forgets every mediator; stores
/// opened afterwards start from empty mediators.
pub struct LocalLockMediators {
    clock: Arc<dyn LeaseClock>,
    mediators: DashMap<String, Arc<LocalLockMediator>>,
}

impl LocalLockMediators {
    pub fn new(clock: Arc<dyn LeaseClock>) -> Self {
        Self {
            clock,
            mediators: DashMap::new(),
        }
    }

    /// Mediator of `namespace`, created on first use.
    pub fn get(&self, namespace: &str) -> Arc<LocalLockMediator> {
        self.mediators
            .entry(namespace.to_string())
            .or_insert_with(|| {
                debug!(namespace, "Creating local lock mediator");
                Arc::new(LocalLockMediator::new(namespace, self.clock.clone()))
            })
            .clone()
    }

    pub fn clock(&self) -> &Arc<dyn LeaseClock> {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.mediators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mediators.is_empty()
    }

    pub fn clear(&self) {
        self.mediators.clear();
    }
}
