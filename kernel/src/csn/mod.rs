// Change Sequence Numbers
//
// A CSN identifies one update event. CSNs are totally ordered by
// (time, replica_id, seq) and that order must survive the byte encoding
// used as the store key, because the store sorts keys bytewise.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Width of a CSN in its text form: 16 hex digits of time, 4 of replica id
/// and 8 of sequence number.
pub const CSN_TEXT_LEN: usize = 28;

const TIME_DIGITS: usize = 16;
const REPLICA_DIGITS: usize = 4;

/// Replica id reserved for counter records. Real updates never carry it.
pub const COUNTER_REPLICA_ID: u16 = 0;

/// Errors raised when stored bytes cannot be turned back into a record.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("invalid digit in key {0:?}")]
    Digit(String),

    #[error("invalid record payload: {0}")]
    Payload(String),
}

/// Change sequence number.
///
/// Field order matters: the derived `Ord` compares `time`, then
/// `replica_id`, then `seq`, which is the same order the encoded bytes sort in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Csn {
    /// Wall-clock time in milliseconds.
    pub time: u64,
    pub replica_id: u16,
    /// Sequence number within the same millisecond.
    pub seq: u32,
}

impl Csn {
    pub const fn new(time: u64, replica_id: u16, seq: u32) -> Self {
        Self {
            time,
            replica_id,
            seq,
        }
    }

    /// Key of the counter record placed at `time`.
    pub const fn counter(time: u64) -> Self {
        Self::new(time, COUNTER_REPLICA_ID, 0)
    }

    /// Whether this key is reserved for a counter record.
    pub const fn is_counter(&self) -> bool {
        self.replica_id == COUNTER_REPLICA_ID && self.seq == 0
    }

    pub fn is_older_than(&self, other: &Csn) -> bool {
        self < other
    }

    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    /// Fixed-width, zero-padded, lowercase hex form. Lowercase keeps the
    /// digits `0-9a-f` in ascending byte order.
    pub fn to_text(&self) -> String {
        format!("{:016x}{:04x}{:08x}", self.time, self.replica_id, self.seq)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != CSN_TEXT_LEN {
            return Err(DecodeError::Length {
                expected: CSN_TEXT_LEN,
                actual: bytes.len(),
            });
        }
        // only the canonical lowercase form, so each CSN has one encoding
        if !bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DecodeError::Digit(
                String::from_utf8_lossy(bytes).into_owned(),
            ));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::Digit(String::from_utf8_lossy(bytes).into_owned()))?;
        let digit_err = |_| DecodeError::Digit(text.to_string());

        let (time, rest) = text.split_at(TIME_DIGITS);
        let (replica_id, seq) = rest.split_at(REPLICA_DIGITS);

        Ok(Self {
            time: u64::from_str_radix(time, 16).map_err(digit_err)?,
            replica_id: u16::from_str_radix(replica_id, 16).map_err(digit_err)?,
            seq: u32::from_str_radix(seq, 16).map_err(digit_err)?,
        })
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for Csn {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl TryFrom<String> for Csn {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Csn> for String {
    fn from(csn: Csn) -> Self {
        csn.to_text()
    }
}
