// Log Cursors
//
// Forward iteration over a log keyspace starting at a caller-chosen key.
// Counter records and undecodable entries are skipped. A cursor whose scan
// loses its position (because a concurrent purge deleted the entry it was
// parked on) re-derives its position from the last record it delivered.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::log::handle::LogHandle;
use crate::log::ChangelogError;
use crate::record::{LogKey, LogRecord};
use crate::store::{Seek, StoreError, StoreScan};

pub(crate) mod delete;

/// How to resolve a start key that is not present in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Absent start key: the cursor is exhausted immediately.
    EqualTo,
    /// Reposition to the smallest present key >= start.
    GreaterOrEqual,
    /// Reposition to the largest present key <= start.
    LessOrEqual,
}

/// Where the first `advance` lands relative to the matched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStrategy {
    OnMatchingKey,
    /// Skip the matched key when it is not greater than the start key.
    AfterMatchingKey,
}

/// What the scan is currently parked on.
enum Parked<R> {
    Record(R),
    Skip,
    End,
}

/// Forward cursor over the real records of a log.
///
/// The underlying scan is opened lazily by the first `advance`. Cursors
/// count as open until `close` is called or they are dropped.
pub struct LogCursor<R: LogRecord> {
    handle: Option<Arc<LogHandle>>,
    scan: Option<StoreScan>,
    start: Option<R::Key>,
    matching: MatchStrategy,
    positioning: PositionStrategy,
    last_nonnull_key: Option<R::Key>,
    /// Whether `advance` has handed out at least one record.
    delivered: bool,
    current: Option<R>,
    exhausted: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: LogRecord> std::fmt::Debug for LogCursor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCursor")
            .field("start", &self.start)
            .field("matching", &self.matching)
            .field("positioning", &self.positioning)
            .field("last_nonnull_key", &self.last_nonnull_key)
            .field("delivered", &self.delivered)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl<R: LogRecord> LogCursor<R> {
    pub(crate) fn new(
        handle: Arc<LogHandle>,
        start: Option<R::Key>,
        matching: MatchStrategy,
        positioning: PositionStrategy,
    ) -> Self {
        handle.cursor_opened();
        Self {
            handle: Some(handle),
            scan: None,
            start,
            matching,
            positioning,
            last_nonnull_key: start,
            delivered: false,
            current: None,
            exhausted: false,
            _record: PhantomData,
        }
    }

    /// A cursor that never yields anything, handed out by closed logs.
    pub(crate) fn exhausted() -> Self {
        Self {
            handle: None,
            scan: None,
            start: None,
            matching: MatchStrategy::EqualTo,
            positioning: PositionStrategy::OnMatchingKey,
            last_nonnull_key: None,
            delivered: false,
            current: None,
            exhausted: true,
            _record: PhantomData,
        }
    }

    /// Record the cursor is positioned on after a successful `advance`.
    pub fn record(&self) -> Option<&R> {
        self.current.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Move to the next real record. Returns `false` once the cursor is
    /// exhausted; it then stays exhausted.
    pub fn advance(&mut self) -> Result<bool, ChangelogError> {
        self.current = None;
        if self.exhausted {
            return Ok(false);
        }
        let Some(handle) = self.handle.clone() else {
            self.exhausted = true;
            return Ok(false);
        };
        let _shared = handle.shared();

        match self.advance_locked(&handle) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.finish();
                Ok(false)
            }
            Err(ChangelogError::Store(StoreError::Closed | StoreError::MissingKeyspace(_)))
                if handle.is_closed() =>
            {
                self.finish();
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Release the scan. Idempotent.
    pub fn close(&mut self) {
        self.finish();
        self.current = None;
        if let Some(handle) = self.handle.take() {
            handle.cursor_closed();
        }
    }

    fn finish(&mut self) {
        self.exhausted = true;
        self.scan = None;
    }

    fn advance_locked(&mut self, handle: &LogHandle) -> Result<bool, ChangelogError> {
        let mut parked_on_entry = match self.scan.as_mut() {
            Some(scan) => scan.next()?,
            None => {
                let mut scan = handle.scan();
                let positioned =
                    position::<R::Key>(&mut scan, self.start, self.matching, self.positioning)?;
                self.scan = Some(scan);
                positioned
            }
        };
        let mut healed = false;

        loop {
            if parked_on_entry {
                match self.inspect() {
                    Parked::Record(record) => {
                        self.last_nonnull_key = Some(record.key());
                        self.delivered = true;
                        self.current = Some(record);
                        return Ok(true);
                    }
                    Parked::Skip => {
                        parked_on_entry = match self.scan.as_mut() {
                            Some(scan) => scan.next()?,
                            None => false,
                        };
                        continue;
                    }
                    Parked::End => return Ok(false),
                }
            }

            // The scan ran out. If it was parked on a record that has since
            // been purged, resume right after the last record we handed out.
            let Some(last) = self.last_nonnull_key.filter(|_| self.delivered) else {
                return Ok(false);
            };
            if healed {
                return Ok(false);
            }
            healed = true;
            debug!(last = %last, "reopening cursor after its scan ran out");
            let mut scan = handle.scan();
            parked_on_entry = position::<R::Key>(
                &mut scan,
                Some(last),
                MatchStrategy::GreaterOrEqual,
                PositionStrategy::AfterMatchingKey,
            )?;
            self.scan = Some(scan);
        }
    }

    fn inspect(&self) -> Parked<R> {
        let Some((key, value)) = self.scan.as_ref().and_then(StoreScan::current) else {
            return Parked::End;
        };
        let key = match R::Key::from_key_bytes(key) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "skipping entry with undecodable key");
                return Parked::Skip;
            }
        };
        if key.is_counter() {
            return Parked::Skip;
        }
        match R::decode(key, value) {
            Ok(record) => Parked::Record(record),
            Err(err) => {
                warn!(key = %key, error = %err, "skipping undecodable record");
                Parked::Skip
            }
        }
    }
}

impl<R: LogRecord + Clone> Iterator for LogCursor<R> {
    type Item = Result<R, ChangelogError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(true) => self.current.clone().map(Ok),
            Ok(false) => None,
            Err(err) => {
                self.finish();
                Some(Err(err))
            }
        }
    }
}

impl<R: LogRecord> Drop for LogCursor<R> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Park `scan` where the first record for the given start key and
/// strategies is. Returns `false` when no such entry exists.
pub(crate) fn position<K: LogKey>(
    scan: &mut StoreScan,
    start: Option<K>,
    matching: MatchStrategy,
    positioning: PositionStrategy,
) -> Result<bool, StoreError> {
    let Some(start) = start else {
        return scan.position(Seek::First);
    };
    let start_bytes = start.to_key_bytes();

    let matched = match matching {
        MatchStrategy::EqualTo => scan.position(Seek::Exact(&start_bytes))?,
        MatchStrategy::GreaterOrEqual => scan.position(Seek::AtOrAfter(&start_bytes))?,
        MatchStrategy::LessOrEqual => {
            let mut found = scan.position(Seek::AtOrBefore(&start_bytes))?;
            while found && is_counter_key::<K>(scan.current_key()) {
                found = scan.prev()?;
            }
            found
        }
    };
    if !matched {
        return Ok(false);
    }

    match positioning {
        PositionStrategy::OnMatchingKey => Ok(true),
        PositionStrategy::AfterMatchingKey => {
            let at_or_before_start = scan
                .current_key()
                .is_some_and(|key| key <= start_bytes.as_slice());
            if at_or_before_start {
                scan.next()
            } else {
                Ok(true)
            }
        }
    }
}

fn is_counter_key<K: LogKey>(key: Option<&[u8]>) -> bool {
    key.and_then(|bytes| K::from_key_bytes(bytes).ok())
        .is_some_and(|key| key.is_counter())
}
