// Keyspace Handle
//
// One keyspace of the ordered store plus the reader/writer lock that
// guards it. Appends, scans and purges take the shared side; clear and
// shutdown take the exclusive side, so no operation is in flight while the
// keyspace is dropped or the log is marked closed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

use super::ChangelogError;
use crate::record::LogKey;
use crate::store::{OrderedStore, Seek, StoreError, StoreScan};

#[derive(Debug)]
pub(crate) struct LogHandle {
    store: Arc<dyn OrderedStore>,
    keyspace: String,
    lock: RwLock<()>,
    closed: AtomicBool,
    open_cursors: AtomicUsize,
}

impl LogHandle {
    /// Bind to `keyspace`, creating it if needed.
    pub(crate) fn open(
        store: Arc<dyn OrderedStore>,
        keyspace: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let keyspace = keyspace.into();
        store.create_keyspace(&keyspace)?;
        Ok(Self {
            store,
            keyspace,
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
            open_cursors: AtomicUsize::new(0),
        })
    }

    pub(crate) fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub(crate) fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    pub(crate) fn store(&self) -> &Arc<dyn OrderedStore> {
        &self.store
    }

    pub(crate) fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub(crate) fn scan(&self) -> StoreScan {
        StoreScan::new(self.store.clone(), self.keyspace.clone())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Fail with `Closed` if the log no longer accepts writes.
    pub(crate) fn ensure_open(&self) -> Result<(), ChangelogError> {
        if self.is_closed() {
            Err(ChangelogError::Closed)
        } else {
            Ok(())
        }
    }

    /// Turn a store failure into a changelog error. A fatal failure closes
    /// the log for every later write.
    pub(crate) fn fail(&self, err: StoreError) -> ChangelogError {
        if err.is_fatal() || !self.store.is_valid() {
            error!(keyspace = %self.keyspace, error = %err, "store failure, closing log");
            self.mark_closed();
        }
        ChangelogError::Store(err)
    }

    /// Drop the keyspace and create it again, empty. Callers hold the
    /// exclusive lock.
    pub(crate) fn recreate(&self) -> Result<(), StoreError> {
        self.store.drop_keyspace(&self.keyspace)?;
        self.store.create_keyspace(&self.keyspace)
    }

    /// Oldest real (non-counter, decodable) key.
    pub(crate) fn first_key<K: LogKey>(&self) -> Result<Option<K>, StoreError> {
        self.edge_key(Seek::First, StoreScan::next)
    }

    /// Newest real (non-counter, decodable) key.
    pub(crate) fn last_key<K: LogKey>(&self) -> Result<Option<K>, StoreError> {
        self.edge_key(Seek::Last, StoreScan::prev)
    }

    fn edge_key<K: LogKey>(
        &self,
        seek: Seek<'_>,
        step: fn(&mut StoreScan) -> Result<bool, StoreError>,
    ) -> Result<Option<K>, StoreError> {
        let mut scan = self.scan();
        let mut found = scan.position(seek)?;
        while found {
            let key = scan
                .current_key()
                .and_then(|bytes| K::from_key_bytes(bytes).ok())
                .filter(|key| !key.is_counter());
            if key.is_some() {
                return Ok(key);
            }
            found = step(&mut scan)?;
        }
        Ok(None)
    }

    pub(crate) fn cursor_opened(&self) {
        self.open_cursors.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn cursor_closed(&self) {
        self.open_cursors.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn open_cursor_count(&self) -> usize {
        self.open_cursors.load(Ordering::Acquire)
    }
}
