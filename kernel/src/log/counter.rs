// Counter Records
//
// Every `counter_window` real records the log interleaves a synthetic
// counter record in the same keyspace. It is written on the first append
// whose time differs from the append that filled the window, keyed at that
// new time with replica id 0, so it sorts after every counted record and
// before the record that closed the window.
//
// A counter value carries the size of its window and the running total of
// real records appended before it. The totals of two counters give the
// number of records between them without scanning.

use tracing::warn;

use super::handle::LogHandle;
use super::ChangelogError;
use crate::csn::{Csn, DecodeError};
use crate::record::LogKey;
use crate::store::{BatchOp, Seek, StoreScan};

const COUNTER_VALUE_LEN: usize = 16;

/// Value stored under a counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    /// Real records written since the previous counter record.
    pub window: u64,
    /// Real records written before this counter record.
    pub total: u64,
}

impl CounterValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(COUNTER_VALUE_LEN);
        bytes.extend_from_slice(&self.window.to_be_bytes());
        bytes.extend_from_slice(&self.total.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != COUNTER_VALUE_LEN {
            return Err(DecodeError::Length {
                expected: COUNTER_VALUE_LEN,
                actual: bytes.len(),
            });
        }
        let (window, total) = bytes.split_at(8);
        Ok(Self {
            window: u64::from_key_bytes(window)?,
            total: u64::from_key_bytes(total)?,
        })
    }
}

/// In-memory bookkeeping of the append path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CounterState {
    window_size: u64,
    since_last: u64,
    total: u64,
    /// Time of the append that filled the current window.
    pending_time: Option<u64>,
}

impl CounterState {
    pub(crate) fn new(window_size: u64) -> Self {
        Self {
            window_size,
            since_last: 0,
            total: 0,
            pending_time: None,
        }
    }

    /// Counter record that has to be written together with `csn`, if the
    /// pending window closes at this append.
    pub(crate) fn counter_for(&self, csn: &Csn) -> Option<(Csn, CounterValue)> {
        match self.pending_time {
            Some(time) if time != csn.time => Some((
                Csn::counter(csn.time),
                CounterValue {
                    window: self.since_last,
                    total: self.total,
                },
            )),
            _ => None,
        }
    }

    /// Batch for appending `csn`: the counter record first, if one is due.
    pub(crate) fn batch_for(&self, csn: &Csn, payload: &[u8]) -> Vec<BatchOp> {
        let mut batch = Vec::with_capacity(2);
        if let Some((key, value)) = self.counter_for(csn) {
            batch.push(BatchOp::Put(key.to_key_bytes(), value.encode()));
        }
        batch.push(BatchOp::Put(csn.to_key_bytes(), payload.to_vec()));
        batch
    }

    /// Account for `csn` once its batch has been committed.
    pub(crate) fn appended(&mut self, csn: &Csn) {
        if self.counter_for(csn).is_some() {
            self.since_last = 0;
            self.pending_time = None;
        }
        self.since_last += 1;
        self.total += 1;
        if self.window_size > 0 && self.pending_time.is_none() && self.since_last >= self.window_size
        {
            self.pending_time = Some(csn.time);
        }
    }

    #[cfg(test)]
    pub(crate) fn since_last(&self) -> u64 {
        self.since_last
    }

    /// Rebuild the state by walking back from the newest key until a counter
    /// record (or the start of the log) is reached.
    pub(crate) fn recover(handle: &LogHandle, window_size: u64) -> Result<Self, ChangelogError> {
        let mut scan = handle.scan();
        let mut state = Self::new(window_size);
        let mut newest_time = None;
        let mut base_total = 0;

        let mut found = scan.position(Seek::Last)?;
        while found {
            match current_csn(&scan) {
                Some(csn) if csn.is_counter() => {
                    base_total = current_counter(&scan).map_or(0, |value| value.total);
                    break;
                }
                Some(csn) => {
                    state.since_last += 1;
                    newest_time.get_or_insert(csn.time);
                }
                None => {}
            }
            found = scan.prev()?;
        }

        state.total = base_total + state.since_last;
        if window_size > 0 && state.since_last >= window_size {
            state.pending_time = newest_time;
        }
        Ok(state)
    }
}

fn current_csn(scan: &StoreScan) -> Option<Csn> {
    let key = scan.current_key()?;
    match Csn::from_key_bytes(key) {
        Ok(csn) => Some(csn),
        Err(err) => {
            warn!(error = %err, "ignoring entry with undecodable key");
            None
        }
    }
}

fn current_counter(scan: &StoreScan) -> Option<CounterValue> {
    let (_, value) = scan.current()?;
    match CounterValue::decode(value) {
        Ok(counter) => Some(counter),
        Err(err) => {
            warn!(error = %err, "ignoring undecodable counter record");
            None
        }
    }
}

/// Estimate the number of real records in `[from, to]`.
///
/// Walks forward from `from` to the first counter record and backward from
/// `to` to the last one; the records in between are taken from the counter
/// totals. Exact as long as nothing in the range has been purged.
pub(crate) fn estimate(handle: &LogHandle, from: Csn, to: Csn) -> Result<u64, ChangelogError> {
    if from > to {
        return Ok(0);
    }
    let mut scan = handle.scan();

    let mut head = 0;
    let mut first_counter = None;
    let mut found = scan.position(Seek::AtOrAfter(&from.to_key_bytes()))?;
    while found {
        match current_csn(&scan) {
            Some(csn) if csn > to => return Ok(head),
            Some(csn) if csn.is_counter() => {
                first_counter = current_counter(&scan);
                if first_counter.is_some() {
                    break;
                }
            }
            Some(_) => head += 1,
            None => {}
        }
        found = scan.next()?;
    }
    let Some(first) = first_counter else {
        return Ok(head);
    };

    let mut tail = 0;
    let mut last_counter = None;
    found = scan.position(Seek::AtOrBefore(&to.to_key_bytes()))?;
    while found {
        match current_csn(&scan) {
            Some(csn) if csn.is_counter() => {
                last_counter = current_counter(&scan);
                if last_counter.is_some() {
                    break;
                }
            }
            Some(_) => tail += 1,
            None => {}
        }
        found = scan.prev()?;
    }
    let last = last_counter.unwrap_or(first);

    Ok(head + last.total.saturating_sub(first.total) + tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csn(time: u64) -> Csn {
        Csn::new(time, 1, 0)
    }

    #[test]
    fn counter_waits_for_a_time_change() {
        let mut state = CounterState::new(3);
        for _ in 0..4 {
            assert_eq!(state.counter_for(&csn(1)), None);
            state.appended(&csn(1));
        }

        let (key, value) = state.counter_for(&csn(2)).unwrap();
        assert_eq!(key, Csn::counter(2));
        assert_eq!(value, CounterValue { window: 4, total: 4 });

        state.appended(&csn(2));
        assert_eq!(state.since_last(), 1);
        assert_eq!(state.counter_for(&csn(3)), None);
    }

    #[test]
    fn zero_window_never_writes_counters() {
        let mut state = CounterState::new(0);
        for time in 0..10 {
            assert_eq!(state.batch_for(&csn(time), b"x").len(), 1);
            state.appended(&csn(time));
        }
    }

    #[test]
    fn counter_value_rejects_short_input() {
        assert_eq!(
            CounterValue::decode(&[0; 4]),
            Err(DecodeError::Length {
                expected: 16,
                actual: 4
            })
        );
    }
}
