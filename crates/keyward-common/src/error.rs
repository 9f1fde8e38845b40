//! Error types for Keyward
//!
//! `StorageError` is the single error enum shared by the store contract, the
//! lock adapters and the ID authority. Variants are grouped by how callers are
//! expected to react to them:
//! - transient storage failures are retried by the component that saw them
//! - temporary failures are handed back to the caller, who may retry
//! - permanent failures signal a programming, capacity or deployment problem

use std::fmt::Write as _;

use bytes::Bytes;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    TemporaryFailure {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },

    #[error("lock on {} held by '{holder}'", describe_cell(.key, .column))]
    LockContention {
        key: Bytes,
        column: Bytes,
        holder: String,
    },

    #[error("expected value violated on {}", describe_cell(.key, .column))]
    ExpectationViolated { key: Bytes, column: Bytes },

    #[error("id overflow in partition {partition}: current {current}, block size {block_size}")]
    IdOverflow {
        partition: u32,
        current: i64,
        block_size: i64,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("corrupted data under {key}: {reason}")]
    CorruptedData { key: String, reason: String },
}

impl StorageError {
    /// Communication failures and write-write conflicts. Bounded retry loops
    /// inside keyward retry exactly these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Conflict(_))
    }

    /// Failures the caller may retry by re-running its whole operation.
    pub fn is_temporary(&self) -> bool {
        self.is_retryable()
            || matches!(
                self,
                Self::TemporaryFailure { .. } | Self::LockContention { .. }
            )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_temporary()
    }

    /// Errors raised by the locking layer, whether temporary or not.
    pub fn is_locking(&self) -> bool {
        matches!(
            self,
            Self::LockContention { .. } | Self::ExpectationViolated { .. }
        )
    }
}

/// Renders a (key, column) pair for messages and log fields: printable ASCII
/// stays readable, everything else is hex-escaped.
pub fn describe_cell(key: &[u8], column: &[u8]) -> String {
    format!("{}/{}", describe_bytes(key), describe_bytes(column))
}

pub fn describe_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for b in bytes {
        if b.is_ascii_graphic() {
            out.push(*b as char);
        } else {
            let _ = write!(out, "\\x{:02x}", b);
        }
    }
    out
}
