// Per-Replica Change Log
//
// Durable, CSN-ordered store of one replica's updates for one domain.
// Appends are expected in CSN order. Records are removed only by purge
// (age based, never the newest one) or by clear.

use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ChangelogConfig;
use crate::csn::{Csn, DecodeError, COUNTER_REPLICA_ID};
use crate::cursor::delete::{delete_in_batches, Verdict};
use crate::cursor::{LogCursor, MatchStrategy, PositionStrategy};
use crate::record::{CsnLimits, LogKey, LogRecord};
use crate::store::{OrderedStore, Seek, StoreError};

pub(crate) mod counter;
pub(crate) mod handle;

pub use counter::CounterValue;

use counter::CounterState;
use handle::LogHandle;

/// One update as stored in a replica log. The payload is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub csn: Csn,
    pub payload: Vec<u8>,
}

impl UpdateRecord {
    pub fn new(csn: Csn, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            csn,
            payload: payload.into(),
        }
    }
}

impl LogRecord for UpdateRecord {
    type Key = Csn;

    fn key(&self) -> Csn {
        self.csn
    }

    fn decode(csn: Csn, value: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::new(csn, value))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChangelogError {
    #[error("changelog is closed")]
    Closed,

    #[error("csn {0} uses the replica id reserved for counter records")]
    ReservedCsn(Csn),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Name of the keyspace holding the log of `replica_id` for `domain`.
pub fn keyspace_name(domain: &str, replica_id: u16) -> String {
    format!("{replica_id}:{domain}")
}

pub struct ReplicaLog {
    domain: String,
    replica_id: u16,
    config: ChangelogConfig,
    handle: Arc<LogHandle>,
    limits: RwLock<CsnLimits>,
    counter: Mutex<CounterState>,
}

impl std::fmt::Debug for ReplicaLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaLog")
            .field("domain", &self.domain)
            .field("replica_id", &self.replica_id)
            .field("limits", &*self.limits.read())
            .finish()
    }
}

impl ReplicaLog {
    /// Open the log, creating its keyspace if needed. Bounds and counter
    /// bookkeeping are rebuilt from what is stored.
    pub fn open(
        store: Arc<dyn OrderedStore>,
        domain: impl Into<String>,
        replica_id: u16,
        config: ChangelogConfig,
    ) -> Result<Self, ChangelogError> {
        let domain = domain.into();
        let handle = LogHandle::open(store, keyspace_name(&domain, replica_id))?;
        let limits = CsnLimits {
            oldest: handle.first_key()?,
            newest: handle.last_key()?,
        };
        let counter = CounterState::recover(&handle, config.counter_window)?;

        info!(
            domain = %domain,
            replica_id,
            oldest = ?limits.oldest,
            newest = ?limits.newest,
            "replica log opened"
        );
        Ok(Self {
            domain,
            replica_id,
            config,
            handle: Arc::new(handle),
            limits: RwLock::new(limits),
            counter: Mutex::new(counter),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn replica_id(&self) -> u16 {
        self.replica_id
    }

    pub fn keyspace(&self) -> &str {
        self.handle.keyspace()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Append one update, together with a counter record when one is due.
    pub fn append(&self, update: &UpdateRecord) -> Result<(), ChangelogError> {
        let _shared = self.handle.shared();
        self.handle.ensure_open()?;
        if update.csn.replica_id == COUNTER_REPLICA_ID {
            return Err(ChangelogError::ReservedCsn(update.csn));
        }

        let mut counter = self.counter.lock();
        let batch = counter.batch_for(&update.csn, &update.payload);
        if batch.len() > 1 {
            debug!(
                domain = %self.domain,
                replica_id = self.replica_id,
                csn = %update.csn,
                "writing counter record"
            );
        }
        self.handle
            .store()
            .write_batch(self.handle.keyspace(), &batch)
            .map_err(|err| self.handle.fail(err))?;
        counter.appended(&update.csn);
        drop(counter);

        let mut limits = self.limits.write();
        *limits = limits.with_appended(update.csn);
        Ok(())
    }

    pub fn limits(&self) -> CsnLimits {
        *self.limits.read()
    }

    pub fn oldest_csn(&self) -> Option<Csn> {
        self.limits.read().oldest
    }

    pub fn newest_csn(&self) -> Option<Csn> {
        self.limits.read().newest
    }

    /// Cursor over the log starting at `start` (the first record when
    /// `None`). A closed log hands out an already exhausted cursor.
    pub fn open_cursor(
        &self,
        start: Option<Csn>,
        matching: MatchStrategy,
        positioning: PositionStrategy,
    ) -> LogCursor<UpdateRecord> {
        let _shared = self.handle.shared();
        if self.handle.is_closed() {
            return LogCursor::exhausted();
        }
        LogCursor::new(self.handle.clone(), start, matching, positioning)
    }

    /// Cursors handed out and not yet closed or dropped.
    pub fn open_cursor_count(&self) -> usize {
        self.handle.open_cursor_count()
    }

    /// Remove records older than `threshold`, except the newest one.
    ///
    /// Work per call is bounded by the purge batch settings; callers repeat
    /// the call until the returned oldest CSN stops changing. Returns the
    /// oldest surviving CSN, or `None` if the log is empty.
    pub fn purge_up_to(&self, threshold: Csn) -> Result<Option<Csn>, ChangelogError> {
        self.handle.ensure_open()?;
        let Some(newest) = self.newest_csn() else {
            return Ok(None);
        };

        let progress = delete_in_batches::<Csn>(
            &self.handle,
            self.config.purge_batch_size,
            Some(self.config.purge_max_batches),
            |csn, _| {
                if csn.is_older_than(&threshold) && csn.is_older_than(&newest) {
                    Verdict::Delete
                } else {
                    Verdict::Stop
                }
            },
        )?;

        let oldest = {
            let _shared = self.handle.shared();
            self.handle.first_key::<Csn>()?
        };
        let mut limits = self.limits.write();
        *limits = limits.with_oldest(oldest);
        drop(limits);

        debug!(
            domain = %self.domain,
            replica_id = self.replica_id,
            threshold = %threshold,
            deleted = progress.deleted,
            finished = progress.finished,
            oldest = ?oldest,
            "purged replica log"
        );
        Ok(oldest)
    }

    /// Estimated number of records in `[from, to]`, from counter records.
    pub fn count(&self, from: Csn, to: Csn) -> Result<u64, ChangelogError> {
        let _shared = self.handle.shared();
        counter::estimate(&self.handle, from, to)
    }

    /// Drop every record and start over with an empty keyspace.
    pub fn clear(&self) -> Result<(), ChangelogError> {
        let _exclusive = self.handle.exclusive();
        self.handle.ensure_open()?;
        self.handle
            .recreate()
            .map_err(|err| self.handle.fail(err))?;
        *self.limits.write() = CsnLimits::empty();
        *self.counter.lock() = CounterState::new(self.config.counter_window);

        info!(domain = %self.domain, replica_id = self.replica_id, "replica log cleared");
        Ok(())
    }

    /// Stop accepting appends. Cursors opened earlier can still be drained.
    pub fn shutdown(&self) {
        let _exclusive = self.handle.exclusive();
        self.handle.mark_closed();

        let open_cursors = self.handle.open_cursor_count();
        if open_cursors > 0 {
            warn!(
                domain = %self.domain,
                replica_id = self.replica_id,
                open_cursors,
                "replica log shut down with cursors still open"
            );
        }
        info!(domain = %self.domain, replica_id = self.replica_id, "replica log shut down");
    }

    /// Write every stored key as text, counter records included.
    pub fn dump<W: io::Write>(&self, out: &mut W) -> Result<(), ChangelogError> {
        let _shared = self.handle.shared();
        let mut scan = self.handle.scan();
        let mut found = scan.position(Seek::First)?;
        while found {
            if let Some((key, value)) = scan.current() {
                match Csn::from_key_bytes(key) {
                    Ok(csn) if csn.is_counter() => match CounterValue::decode(value) {
                        Ok(counter) => writeln!(
                            out,
                            "{csn} counter window={} total={}",
                            counter.window, counter.total
                        )?,
                        Err(err) => writeln!(out, "{csn} counter ({err})")?,
                    },
                    Ok(csn) => writeln!(out, "{csn} update {} bytes", value.len())?,
                    Err(err) => writeln!(out, "{} ({err})", String::from_utf8_lossy(key))?,
                }
            }
            found = scan.next()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, OrderedStore};

    const DOMAIN: &str = "dc=example,dc=com";

    fn csn(time: u64) -> Csn {
        Csn::new(time, 1, 0)
    }

    fn open(store: &Arc<MemoryStore>, config: ChangelogConfig) -> ReplicaLog {
        ReplicaLog::open(store.clone(), DOMAIN, 1, config).unwrap()
    }

    fn append_times(log: &ReplicaLog, times: impl IntoIterator<Item = u64>) {
        for time in times {
            log.append(&UpdateRecord::new(csn(time), time.to_be_bytes()))
                .unwrap();
        }
    }

    fn all_csns(log: &ReplicaLog) -> Vec<Csn> {
        log.open_cursor(None, MatchStrategy::EqualTo, PositionStrategy::OnMatchingKey)
            .map(|record| record.unwrap().csn)
            .collect()
    }

    fn window(counter_window: u64) -> ChangelogConfig {
        ChangelogConfig {
            counter_window,
            ..ChangelogConfig::default_config()
        }
    }

    #[test]
    fn yields_records_in_csn_order_without_counters() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, window(10));
        append_times(&log, 1..=95);

        let csns = all_csns(&log);
        assert_eq!(csns, (1..=95).map(csn).collect::<Vec<_>>());
        // 9 counter records interleaved with the 95 updates
        assert_eq!(store.key_count(log.keyspace()), 104);
    }

    #[test]
    fn payload_survives_storage() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, ChangelogConfig::default_config());
        log.append(&UpdateRecord::new(csn(1), b"modify cn=x".to_vec()))
            .unwrap();

        let mut cursor = log.open_cursor(
            Some(csn(1)),
            MatchStrategy::EqualTo,
            PositionStrategy::OnMatchingKey,
        );
        assert!(cursor.advance().unwrap());
        assert_eq!(cursor.record().unwrap().payload, b"modify cn=x");
    }

    #[test]
    fn bounds_follow_appends() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, ChangelogConfig::default_config());
        assert_eq!(log.limits(), CsnLimits::empty());

        append_times(&log, [3, 5]);
        log.append(&UpdateRecord::new(csn(4), vec![])).unwrap();

        assert_eq!(log.oldest_csn(), Some(csn(3)));
        assert_eq!(log.newest_csn(), Some(csn(5)));
    }

    #[test]
    fn purge_keeps_newest_record() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, ChangelogConfig::default_config());
        append_times(&log, [1, 2, 3]);

        let oldest = log.purge_up_to(csn(10)).unwrap();

        assert_eq!(oldest, Some(csn(3)));
        assert_eq!(log.oldest_csn(), Some(csn(3)));
        assert_eq!(log.newest_csn(), Some(csn(3)));
        assert_eq!(all_csns(&log), vec![csn(3)]);
    }

    #[test]
    fn purge_stops_at_threshold() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, ChangelogConfig::default_config());
        append_times(&log, 1..=10);

        assert_eq!(log.purge_up_to(csn(4)).unwrap(), Some(csn(4)));
        assert_eq!(all_csns(&log), (4..=10).map(csn).collect::<Vec<_>>());
    }

    #[test]
    fn purge_of_empty_log_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, ChangelogConfig::default_config());
        assert_eq!(log.purge_up_to(csn(10)).unwrap(), None);
    }

    #[test]
    fn purge_work_is_bounded_per_call() {
        let store = Arc::new(MemoryStore::new());
        let config = ChangelogConfig {
            counter_window: 0,
            purge_batch_size: 2,
            purge_max_batches: 3,
        };
        let log = open(&store, config);
        append_times(&log, 1..=20);

        assert_eq!(log.purge_up_to(csn(100)).unwrap(), Some(csn(7)));
        assert_eq!(log.purge_up_to(csn(100)).unwrap(), Some(csn(13)));
        assert_eq!(log.purge_up_to(csn(100)).unwrap(), Some(csn(19)));
        assert_eq!(log.purge_up_to(csn(100)).unwrap(), Some(csn(20)));
        assert_eq!(log.purge_up_to(csn(100)).unwrap(), Some(csn(20)));
    }

    #[test]
    fn counter_records_follow_the_window() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, window(1000));
        append_times(&log, 1..=2500);

        assert_eq!(store.key_count(log.keyspace()), 2502);
        assert_eq!(all_csns(&log).len(), 2500);
        assert!(store
            .get(log.keyspace(), &Csn::counter(1001).to_key_bytes())
            .unwrap()
            .is_some());
        assert!(store
            .get(log.keyspace(), &Csn::counter(2001).to_key_bytes())
            .unwrap()
            .is_some());
    }

    #[test]
    fn counter_record_is_deferred_past_equal_timestamps() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, window(2));
        for seq in 0..4 {
            log.append(&UpdateRecord::new(Csn::new(7, 1, seq), vec![]))
                .unwrap();
        }
        assert_eq!(store.key_count(log.keyspace()), 4);

        log.append(&UpdateRecord::new(csn(8), vec![])).unwrap();
        let stored = store
            .get(log.keyspace(), &Csn::counter(8).to_key_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(
            CounterValue::decode(&stored).unwrap(),
            CounterValue { window: 4, total: 4 }
        );
    }

    #[test]
    fn count_uses_counter_records() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, window(1000));
        append_times(&log, 1..=2500);

        assert_eq!(log.count(csn(1), csn(2500)).unwrap(), 2500);
        assert_eq!(log.count(csn(10), csn(2400)).unwrap(), 2391);
        assert_eq!(log.count(csn(1200), csn(1300)).unwrap(), 101);
        assert_eq!(log.count(csn(30), csn(20)).unwrap(), 0);
    }

    #[test]
    fn reopen_restores_bounds_and_counter_state() {
        let store = Arc::new(MemoryStore::new());
        {
            let log = open(&store, window(1000));
            append_times(&log, 1..=1500);
            log.shutdown();
        }

        let log = open(&store, window(1000));
        assert_eq!(log.oldest_csn(), Some(csn(1)));
        assert_eq!(log.newest_csn(), Some(csn(1500)));
        assert_eq!(log.counter.lock().since_last(), 500);

        append_times(&log, 1501..=2100);
        // second counter lands on the 2001st record
        assert_eq!(store.key_count(log.keyspace()), 2102);
        assert_eq!(log.count(csn(1), csn(2100)).unwrap(), 2100);
    }

    #[test]
    fn shutdown_rejects_appends_and_new_cursors() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, ChangelogConfig::default_config());
        append_times(&log, 1..=3);
        let mut in_flight = log.open_cursor(
            None,
            MatchStrategy::EqualTo,
            PositionStrategy::OnMatchingKey,
        );
        assert!(in_flight.advance().unwrap());

        log.shutdown();

        assert!(matches!(
            log.append(&UpdateRecord::new(csn(4), vec![])),
            Err(ChangelogError::Closed)
        ));
        let mut late = log.open_cursor(
            None,
            MatchStrategy::EqualTo,
            PositionStrategy::OnMatchingKey,
        );
        assert!(!late.advance().unwrap());

        assert!(in_flight.advance().unwrap());
        assert!(in_flight.advance().unwrap());
        assert!(!in_flight.advance().unwrap());
    }

    #[test]
    fn fatal_store_error_closes_the_log() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, ChangelogConfig::default_config());
        append_times(&log, [1]);

        store.close().unwrap();

        assert!(matches!(
            log.append(&UpdateRecord::new(csn(2), vec![])),
            Err(ChangelogError::Store(StoreError::Closed))
        ));
        assert!(log.is_closed());
        assert!(matches!(
            log.append(&UpdateRecord::new(csn(3), vec![])),
            Err(ChangelogError::Closed)
        ));
    }

    #[test]
    fn clear_empties_the_log() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, window(2));
        append_times(&log, 1..=10);

        log.clear().unwrap();

        assert_eq!(log.limits(), CsnLimits::empty());
        assert!(all_csns(&log).is_empty());
        assert_eq!(store.key_count(log.keyspace()), 0);

        append_times(&log, [11]);
        assert_eq!(log.oldest_csn(), Some(csn(11)));
    }

    #[test]
    fn reserved_replica_id_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, ChangelogConfig::default_config());

        assert!(matches!(
            log.append(&UpdateRecord::new(Csn::new(5, 0, 3), vec![])),
            Err(ChangelogError::ReservedCsn(_))
        ));
        assert_eq!(log.newest_csn(), None);
    }

    #[test]
    fn dump_lists_counter_records() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store, window(1));
        append_times(&log, [1, 2]);

        let mut out = Vec::new();
        log.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("update 8 bytes"));
        assert!(lines[1].ends_with("counter window=1 total=1"));
    }

    #[test]
    fn readers_see_increasing_csns_during_appends_and_purges() {
        let store = Arc::new(MemoryStore::new());
        let config = ChangelogConfig {
            counter_window: 7,
            purge_batch_size: 5,
            purge_max_batches: 2,
        };
        let log = open(&store, config);
        append_times(&log, [1]);

        std::thread::scope(|scope| {
            scope.spawn(|| append_times(&log, 2..=400));
            scope.spawn(|| {
                for threshold in (0..400).step_by(10) {
                    log.purge_up_to(csn(threshold)).unwrap();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    let csns = all_csns(&log);
                    assert!(csns.windows(2).all(|pair| pair[0] < pair[1]));
                });
            }
        });

        assert_eq!(log.newest_csn(), Some(csn(400)));
        assert_eq!(log.open_cursor_count(), 0);
    }
}
