// Change-Number Index
//
// Maps a process-wide, monotonically increasing change number to the
// (domain, CSN) it denotes, so external readers can address changes by a
// plain integer. Shares cursor, purge and locking code with the replica
// logs; only the key type differs.
//
// The generator is recovered from the newest stored entry, which is why
// purge always keeps that entry. After a clear there is no such entry, so
// the generator is also written under change number 0, which is never
// handed out.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ChangelogConfig;
use crate::csn::{Csn, DecodeError};
use crate::cursor::delete::{delete_in_batches, Verdict};
use crate::cursor::{LogCursor, MatchStrategy, PositionStrategy};
use crate::log::handle::LogHandle;
use crate::log::ChangelogError;
use crate::record::{KeyLimits, LogKey, LogRecord};
use crate::store::{BatchOp, OrderedStore};

/// Keyspace holding the index.
pub const INDEX_KEYSPACE: &str = "changenumberindex";

/// Key of the generator high-water mark written by `clear`.
const HIGH_WATER_KEY: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNumberRecord {
    pub change_number: u64,
    pub domain: String,
    pub csn: Csn,
}

/// Stored value: everything but the change number, which is the key.
#[derive(Serialize, Deserialize)]
struct StoredEntry<'a> {
    domain: std::borrow::Cow<'a, str>,
    csn: Csn,
}

impl ChangeNumberRecord {
    fn encode_value(&self) -> Result<Vec<u8>, DecodeError> {
        let entry = StoredEntry {
            domain: self.domain.as_str().into(),
            csn: self.csn,
        };
        serde_json::to_vec(&entry).map_err(|err| DecodeError::Payload(err.to_string()))
    }
}

impl LogRecord for ChangeNumberRecord {
    type Key = u64;

    fn key(&self) -> u64 {
        self.change_number
    }

    fn decode(change_number: u64, value: &[u8]) -> Result<Self, DecodeError> {
        let entry: StoredEntry<'_> =
            serde_json::from_slice(value).map_err(|err| DecodeError::Payload(err.to_string()))?;
        Ok(Self {
            change_number,
            domain: entry.domain.into_owned(),
            csn: entry.csn,
        })
    }
}

#[derive(Debug)]
pub struct ChangeNumberIndex {
    config: ChangelogConfig,
    handle: Arc<LogHandle>,
    limits: RwLock<KeyLimits<u64>>,
    /// Last generated change number. Held while the entry is written, so
    /// entries become visible in change-number order.
    generator: Mutex<u64>,
}

impl ChangeNumberIndex {
    pub fn open(store: Arc<dyn OrderedStore>, config: ChangelogConfig) -> Result<Self, ChangelogError> {
        let handle = LogHandle::open(store, INDEX_KEYSPACE)?;
        let limits = KeyLimits {
            oldest: handle.first_key::<u64>()?,
            newest: handle.last_key::<u64>()?,
        };
        let high_water = match handle
            .store()
            .get(handle.keyspace(), &HIGH_WATER_KEY.to_key_bytes())?
        {
            Some(value) => u64::from_key_bytes(&value)?,
            None => 0,
        };
        let last_generated = limits.newest.unwrap_or(0).max(high_water);

        info!(
            oldest = ?limits.oldest,
            newest = ?limits.newest,
            last_generated,
            "change number index opened"
        );
        Ok(Self {
            config,
            handle: Arc::new(handle),
            limits: RwLock::new(limits),
            generator: Mutex::new(last_generated),
        })
    }

    /// Record that `csn` of `domain` was appended and return the change
    /// number assigned to it.
    pub fn append(&self, domain: &str, csn: Csn) -> Result<u64, ChangelogError> {
        let _shared = self.handle.shared();
        self.handle.ensure_open()?;

        let mut generator = self.generator.lock();
        let change_number = *generator + 1;
        let record = ChangeNumberRecord {
            change_number,
            domain: domain.to_string(),
            csn,
        };
        let batch = [BatchOp::Put(change_number.to_key_bytes(), record.encode_value()?)];
        self.handle
            .store()
            .write_batch(self.handle.keyspace(), &batch)
            .map_err(|err| self.handle.fail(err))?;
        *generator = change_number;
        drop(generator);

        let mut limits = self.limits.write();
        *limits = limits.with_appended(change_number);
        Ok(change_number)
    }

    pub fn oldest(&self) -> Option<u64> {
        self.limits.read().oldest
    }

    pub fn newest(&self) -> Option<u64> {
        self.limits.read().newest
    }

    /// Highest change number handed out so far.
    pub fn last_generated(&self) -> u64 {
        *self.generator.lock()
    }

    pub fn get(&self, change_number: u64) -> Result<Option<ChangeNumberRecord>, ChangelogError> {
        let _shared = self.handle.shared();
        self.handle.ensure_open()?;
        self.load(change_number)
    }

    pub fn open_cursor(
        &self,
        start: Option<u64>,
        matching: MatchStrategy,
        positioning: PositionStrategy,
    ) -> LogCursor<ChangeNumberRecord> {
        let _shared = self.handle.shared();
        if self.handle.is_closed() {
            return LogCursor::exhausted();
        }
        LogCursor::new(self.handle.clone(), start, matching, positioning)
    }

    pub fn open_cursor_count(&self) -> usize {
        self.handle.open_cursor_count()
    }

    /// Remove entries whose CSN is older than `threshold`, walking from the
    /// oldest change number and stopping at the first entry that is not.
    /// The newest entry is always kept. Returns the oldest surviving entry.
    pub fn purge_up_to(&self, threshold: Csn) -> Result<Option<ChangeNumberRecord>, ChangelogError> {
        self.handle.ensure_open()?;
        let Some(newest) = self.newest() else {
            return Ok(None);
        };

        let progress = delete_in_batches::<u64>(
            &self.handle,
            self.config.purge_batch_size,
            Some(self.config.purge_max_batches),
            |change_number, value| {
                if change_number.is_counter() {
                    return Verdict::Keep;
                }
                if *change_number >= newest {
                    return Verdict::Stop;
                }
                match ChangeNumberRecord::decode(*change_number, value) {
                    Ok(record) if record.csn.is_older_than(&threshold) => Verdict::Delete,
                    Ok(_) => Verdict::Stop,
                    Err(err) => {
                        warn!(change_number, error = %err, "keeping undecodable index entry");
                        Verdict::Keep
                    }
                }
            },
        )?;
        debug!(
            threshold = %threshold,
            deleted = progress.deleted,
            finished = progress.finished,
            "purged change number index"
        );

        self.refresh_oldest()
    }

    /// Remove every entry of `domain` except the newest entry overall.
    /// Returns how many entries were removed.
    pub fn remove_domain(&self, domain: &str) -> Result<u64, ChangelogError> {
        self.handle.ensure_open()?;
        let Some(newest) = self.newest() else {
            return Ok(0);
        };

        let progress = delete_in_batches::<u64>(
            &self.handle,
            self.config.purge_batch_size,
            None,
            |change_number, value| {
                if change_number.is_counter() {
                    return Verdict::Keep;
                }
                if *change_number >= newest {
                    return Verdict::Stop;
                }
                match ChangeNumberRecord::decode(*change_number, value) {
                    Ok(record) if record.domain == domain => Verdict::Delete,
                    Ok(_) => Verdict::Keep,
                    Err(err) => {
                        warn!(change_number, error = %err, "keeping undecodable index entry");
                        Verdict::Keep
                    }
                }
            },
        )?;
        self.refresh_oldest()?;

        info!(domain, removed = progress.deleted, "domain removed from change number index");
        Ok(progress.deleted)
    }

    /// Drop every entry. The generator keeps counting from where it was,
    /// across restarts too.
    pub fn clear(&self) -> Result<(), ChangelogError> {
        let _exclusive = self.handle.exclusive();
        self.handle.ensure_open()?;
        let last_generated = *self.generator.lock();
        self.handle
            .recreate()
            .and_then(|()| {
                self.handle.store().put(
                    self.handle.keyspace(),
                    &HIGH_WATER_KEY.to_key_bytes(),
                    &last_generated.to_key_bytes(),
                )
            })
            .map_err(|err| self.handle.fail(err))?;
        *self.limits.write() = KeyLimits::empty();

        info!(last_generated, "change number index cleared");
        Ok(())
    }

    pub fn shutdown(&self) {
        let _exclusive = self.handle.exclusive();
        self.handle.mark_closed();

        let open_cursors = self.handle.open_cursor_count();
        if open_cursors > 0 {
            warn!(open_cursors, "change number index shut down with cursors still open");
        }
        info!("change number index shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    fn refresh_oldest(&self) -> Result<Option<ChangeNumberRecord>, ChangelogError> {
        let _shared = self.handle.shared();
        let oldest = self.handle.first_key::<u64>()?;
        let mut limits = self.limits.write();
        *limits = limits.with_oldest(oldest);
        drop(limits);

        match oldest {
            Some(change_number) => self.load(change_number),
            None => Ok(None),
        }
    }

    fn load(&self, change_number: u64) -> Result<Option<ChangeNumberRecord>, ChangelogError> {
        let value = self
            .handle
            .store()
            .get(self.handle.keyspace(), &change_number.to_key_bytes())?;
        match value {
            Some(value) => Ok(Some(ChangeNumberRecord::decode(change_number, &value)?)),
            None => Ok(None),
        }
    }
}
