//! Keyward Common - Shared contracts and primitives
//!
//! This crate provides the foundation used by every Keyward component:
//! - Key-column-value store traits and capability flags
//! - Error taxonomy (`StorageError`)
//! - Configuration loading
//! - Lease clock abstraction
//! - Bounded retry combinator

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod retry;
pub mod store;

// Re-exports for convenience
pub use clock::{LeaseClock, ManualClock, SystemClock};
pub use config::KeywardConfig;
pub use error::{StorageError, StorageResult};
pub use retry::{Backoff, RetryPolicy};
pub use store::{
    ConsistencyLevel, Entry, KeyColumnValueStore, KeyRange, SliceQuery, StoreFeatures,
    StoreManager, StoreTransaction,
};
