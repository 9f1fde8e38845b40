//! Keyward Locking - Distributed locks over weakly consistent stores
//!
//! This crate provides:
//! - Process-local lock mediation (`LocalLockMediator`)
//! - Consistent-key lock adapter with timestamped claims and lazy verification
//! - Transactional lock adapter for stores with isolated transactions
//! - A factory choosing the adapter from the backend's capabilities

pub mod claim;
pub mod consistent_key;
pub mod manager;
pub mod mediator;
pub mod transactional;

// Re-exports for convenience
pub use claim::{ClaimRecord, Claimant, KeyColumn, LockClaim};
pub use consistent_key::{
    ConsistentKeyLockConfig, ConsistentKeyLockStore, ConsistentKeyLockTransaction, lock_store_name,
};
pub use manager::{LockStrategy, LockingStore, LockingStoreManager, LockingTransaction};
pub use mediator::{LocalLockMediator, LocalLockMediators};
pub use transactional::{TransactionalLockStore, TransactionalLockTransaction};
