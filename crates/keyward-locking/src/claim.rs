//! Lock claim model and its storage encoding
//!
//! A claim on `(key, column)` is stored in the lock database as a single
//! empty-valued cell:
//!
//! ```text
//! row    = key length (u32 BE) | key | column
//! column = timestamp ms (i64 BE) | tx token (u64 BE) | instance id
//! ```
//!
//! All claims on one target share a row, so a single slice read returns every
//! competing claim. Among live claims the one with the smallest
//! `(timestamp, instance id, token)` wins.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use keyward_common::error::{StorageError, describe_bytes, describe_cell};
use keyward_common::StorageResult;

const TIMESTAMP_LEN: usize = 8;
const TOKEN_LEN: usize = 8;
const CLAIM_HEADER_LEN: usize = TIMESTAMP_LEN + TOKEN_LEN;

/// A (key, column) pair that can be locked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyColumn {
    pub key: Bytes,
    pub column: Bytes,
}

impl KeyColumn {
    pub fn new(key: impl Into<Bytes>, column: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            column: column.into(),
        }
    }

    /// Row of the lock database holding every claim on this target.
    pub fn lock_row(&self) -> Bytes {
        let mut row = vec![0u8; 4 + self.key.len() + self.column.len()];
        BigEndian::write_u32(&mut row[..4], self.key.len() as u32);
        row[4..4 + self.key.len()].copy_from_slice(&self.key);
        row[4 + self.key.len()..].copy_from_slice(&self.column);
        Bytes::from(row)
    }
}

impl fmt::Display for KeyColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe_cell(&self.key, &self.column))
    }
}

/// Identity of one locking transaction: the owning instance plus a token
/// unique within that instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Claimant {
    pub instance: Bytes,
    pub token: u64,
}

impl Claimant {
    pub fn new(instance: impl Into<Bytes>, token: u64) -> Self {
        Self {
            instance: instance.into(),
            token,
        }
    }
}

impl fmt::Display for Claimant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", describe_bytes(&self.instance), self.token)
    }
}

/// One claim record as stored in the lock database.
///
/// Field order gives the derived ordering: timestamp first, then instance id,
/// then token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimRecord {
    pub timestamp_ms: i64,
    pub claimant: Claimant,
}

impl ClaimRecord {
    pub fn new(timestamp_ms: i64, claimant: Claimant) -> Self {
        Self {
            timestamp_ms,
            claimant,
        }
    }

    pub fn to_column(&self) -> Bytes {
        let mut column = vec![0u8; CLAIM_HEADER_LEN + self.claimant.instance.len()];
        BigEndian::write_i64(&mut column[..TIMESTAMP_LEN], self.timestamp_ms);
        BigEndian::write_u64(&mut column[TIMESTAMP_LEN..CLAIM_HEADER_LEN], self.claimant.token);
        column[CLAIM_HEADER_LEN..].copy_from_slice(&self.claimant.instance);
        Bytes::from(column)
    }

    pub fn from_column(column: &Bytes) -> StorageResult<Self> {
        if column.len() < CLAIM_HEADER_LEN {
            return Err(StorageError::CorruptedData {
                key: describe_bytes(column),
                reason: format!(
                    "lock claim column has {} bytes, expected at least {}",
                    column.len(),
                    CLAIM_HEADER_LEN
                ),
            });
        }
        Ok(Self {
            timestamp_ms: BigEndian::read_i64(&column[..TIMESTAMP_LEN]),
            claimant: Claimant {
                token: BigEndian::read_u64(&column[TIMESTAMP_LEN..CLAIM_HEADER_LEN]),
                instance: column.slice(CLAIM_HEADER_LEN..),
            },
        })
    }

    /// A claim is live while `now < timestamp + expire`.
    pub fn is_live(&self, now_ms: i64, expire_ms: i64) -> bool {
        now_ms < self.timestamp_ms.saturating_add(expire_ms)
    }
}

/// A claim held by an open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockClaim {
    pub target: KeyColumn,
    pub record: ClaimRecord,
    pub expires_at_ms: i64,
    /// Value the data cell must hold when the claim is verified.
    pub expected: Option<Bytes>,
    pub verified: bool,
}

impl LockClaim {
    pub fn new(target: KeyColumn, record: ClaimRecord, expire_ms: i64, expected: Option<Bytes>) -> Self {
        let expires_at_ms = record.timestamp_ms.saturating_add(expire_ms);
        Self {
            target,
            record,
            expires_at_ms,
            expected,
            verified: false,
        }
    }
}

/// Winning claim among `records`, ignoring those expired at `now_ms`.
pub fn winning_claim<'a>(
    records: impl IntoIterator<Item = &'a ClaimRecord>,
    now_ms: i64,
    expire_ms: i64,
) -> Option<&'a ClaimRecord> {
    records
        .into_iter()
        .filter(|record| record.is_live(now_ms, expire_ms))
        .min()
}
