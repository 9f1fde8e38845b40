// Storage layout of ID counters
// One row per partition keyed by the 4-byte big-endian partition id, holding a
// single counter cell with the 8-byte big-endian next free ID.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use keyward_common::error::describe_bytes;
use keyward_common::{KeyRange, StorageError, StorageResult};

use crate::authority::IdBlock;

/// First ID handed out in every partition.
pub const BASE_ID: i64 = 1;

/// Column holding the counter of a partition row.
pub const COUNTER_COLUMN: &[u8] = &[0];

const COUNTER_LEN: usize = 8;
const MIN_PARTITION_KEY_LEN: usize = 4;

pub fn partition_key(partition: u32) -> Bytes {
    let mut key = [0u8; 4];
    BigEndian::write_u32(&mut key, partition);
    Bytes::copy_from_slice(&key)
}

pub fn encode_counter(next: i64) -> Bytes {
    let mut value = [0u8; COUNTER_LEN];
    BigEndian::write_i64(&mut value, next);
    Bytes::copy_from_slice(&value)
}

/// Counter stored for `partition`, or [`BASE_ID`] if none was written yet.
pub fn decode_counter(partition: u32, value: Option<&Bytes>) -> StorageResult<i64> {
    match value {
        None => Ok(BASE_ID),
        Some(value) if value.len() == COUNTER_LEN => Ok(BigEndian::read_i64(value)),
        Some(value) => Err(StorageError::CorruptedData {
            key: describe_bytes(&partition_key(partition)),
            reason: format!(
                "id counter has {} bytes, expected {}",
                value.len(),
                COUNTER_LEN
            ),
        }),
    }
}

/// Block following `current` in `partition`, failing if its end is not representable.
///
/// A block may end exactly at `i64::MAX`; that counter value is then final
/// and the next allocation in the partition overflows.
pub fn next_block(partition: u32, current: i64, block_size: i64) -> StorageResult<IdBlock> {
    match current.checked_add(block_size) {
        Some(end) => Ok(IdBlock::new(current, end)),
        None => Err(StorageError::IdOverflow {
            partition,
            current,
            block_size,
        }),
    }
}

/// Checks that a backend-reported partition has bounds of equal length of at
/// least 4 bytes.
pub fn validate_local_partition(range: KeyRange) -> StorageResult<KeyRange> {
    if range.low.len() != range.high.len() || range.low.len() < MIN_PARTITION_KEY_LEN {
        return Err(StorageError::InvalidState(format!(
            "local key partition [{}, {}) must have bounds of equal length >= {} bytes",
            describe_bytes(&range.low),
            describe_bytes(&range.high),
            MIN_PARTITION_KEY_LEN
        )));
    }
    Ok(range)
}
