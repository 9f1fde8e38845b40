//! Keyward Storage - Reference backends of the store contract
//!
//! The in-memory backend runs in one of two modes matching the two store
//! families keyward coordinates over:
//! - transactional: buffered multi-key transactions validated at commit
//! - consistent-key: immediate per-key atomic writes with compare-and-set
//!
//! Managers opened over the same [`InMemoryStorage`] share data, which lets
//! one process simulate several hosts.

pub mod memory;

pub use memory::{
    FaultInjector, InMemoryStorage, InMemoryStore, InMemoryStoreManager, InMemoryTransaction,
    StorageMode,
};
