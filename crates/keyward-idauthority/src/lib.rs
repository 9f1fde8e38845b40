//! Keyward ID Authority - Partitioned ID block allocation
//!
//! Hands out non-overlapping `[start, end)` ID blocks per partition by
//! incrementing a per-partition counter in the backing store:
//! - `TransactionalIdManager`: read-increment-write inside a native transaction
//! - `ConsistentKeyIdManager`: the same increment as a compare-and-set
//!
//! Both retry contention and transient storage failures under the configured
//! retry policy. [`IdManager::open`] picks the strategy from the backend's
//! capabilities.

pub mod authority;
pub mod codec;
pub mod consistent_key;
pub mod manager;
pub mod transactional;

// Re-exports for convenience
pub use authority::{FixedBlockSizer, IdAuthority, IdBlock, IdBlockSizer};
pub use codec::BASE_ID;
pub use consistent_key::ConsistentKeyIdManager;
pub use manager::{IdManager, IdStrategy};
pub use transactional::TransactionalIdManager;
