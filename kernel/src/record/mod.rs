// Log Keys and Records
//
// Both logs share one cursor and purge implementation. The pieces that differ
// between them (key encoding, record decoding) are expressed here as traits.

use std::fmt;

use crate::csn::{Csn, DecodeError};

/// A key that can be stored in an ordered keyspace.
///
/// `to_key_bytes` must be order preserving: for two keys `a < b`, the
/// encoded bytes of `a` sort before those of `b`.
pub trait LogKey: Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn to_key_bytes(&self) -> Vec<u8>;

    fn from_key_bytes(bytes: &[u8]) -> Result<Self, DecodeError>;

    /// Whether the key addresses a synthetic counter record rather than a
    /// real entry.
    fn is_counter(&self) -> bool {
        false
    }
}

impl LogKey for Csn {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.to_text().into_bytes()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Csn::from_bytes(bytes)
    }

    fn is_counter(&self) -> bool {
        Csn::is_counter(self)
    }
}

/// Change numbers are stored big-endian so bytewise order is numeric order.
impl LogKey for u64 {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| DecodeError::Length {
            expected: 8,
            actual: bytes.len(),
        })?;
        Ok(u64::from_be_bytes(raw))
    }

    /// Change number 0 is never generated. The index keeps bookkeeping
    /// under it.
    fn is_counter(&self) -> bool {
        *self == 0
    }
}

/// A real (non-counter) record read back from a keyspace.
pub trait LogRecord: Sized + Send {
    type Key: LogKey;

    fn key(&self) -> Self::Key;

    fn decode(key: Self::Key, value: &[u8]) -> Result<Self, DecodeError>;
}

/// Snapshot of the oldest and newest keys of a log.
///
/// Never mutated in place: every change builds a new value that replaces the
/// previous one, so readers always see a consistent pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLimits<K> {
    pub oldest: Option<K>,
    pub newest: Option<K>,
}

/// Bounds of a replica log.
pub type CsnLimits = KeyLimits<Csn>;

impl<K: LogKey> KeyLimits<K> {
    pub const fn empty() -> Self {
        Self {
            oldest: None,
            newest: None,
        }
    }

    /// Limits after `key` was appended. The first key becomes both bounds;
    /// afterwards only a key greater than the current newest replaces it.
    pub fn with_appended(self, key: K) -> Self {
        match (self.oldest, self.newest) {
            (Some(oldest), Some(newest)) => Self {
                oldest: Some(oldest),
                newest: Some(newest.max(key)),
            },
            _ => Self {
                oldest: Some(key),
                newest: Some(key),
            },
        }
    }

    /// Limits after the oldest surviving key changed. A log without an
    /// oldest or newest key is empty.
    pub fn with_oldest(self, oldest: Option<K>) -> Self {
        match (oldest, self.newest) {
            (Some(_), Some(_)) => Self { oldest, ..self },
            _ => Self::empty(),
        }
    }
}
