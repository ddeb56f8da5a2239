// Deletion cursors, used only by purge and domain removal.
//
// Deletions are staged while walking the keyspace and written as one atomic
// batch on commit. Each batch is a short transaction; a caller deletes a
// large range as a bounded sequence of batches.

use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::log::handle::LogHandle;
use crate::log::ChangelogError;
use crate::record::LogKey;
use crate::store::{BatchOp, Seek, StoreScan};

/// Decision taken for one entry while deleting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Delete,
    Keep,
    /// Nothing at or after this entry may be deleted.
    Stop,
}

/// Outcome of a bounded sequence of delete batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DeleteProgress {
    pub deleted: u64,
    /// False when the batch cap was hit (or the log closed) before the walk
    /// reached a stop condition.
    pub finished: bool,
}

pub(crate) struct DeleteCursor<'h, K> {
    handle: &'h LogHandle,
    scan: StoreScan,
    positioned: bool,
    resume_after: Option<Vec<u8>>,
    pending: Vec<BatchOp>,
    _key: PhantomData<K>,
}

impl<'h, K: LogKey> DeleteCursor<'h, K> {
    /// Cursor that starts at the first key, or right after `resume_after`.
    pub(crate) fn open(handle: &'h LogHandle, resume_after: Option<Vec<u8>>) -> Self {
        Self {
            handle,
            scan: handle.scan(),
            positioned: false,
            resume_after,
            pending: Vec::new(),
            _key: PhantomData,
        }
    }

    /// Next entry with a decodable key, counter records included.
    pub(crate) fn next(&mut self) -> Result<Option<(K, Vec<u8>)>, ChangelogError> {
        loop {
            let found = if self.positioned {
                self.scan.next()
            } else {
                self.positioned = true;
                match self.resume_after.as_deref() {
                    Some(key) => self.scan.position(Seek::After(key)),
                    None => self.scan.position(Seek::First),
                }
            }
            .map_err(|err| self.handle.fail(err))?;

            let Some((key, value)) = self.scan.current().filter(|_| found) else {
                return Ok(None);
            };
            match K::from_key_bytes(key) {
                Ok(decoded) => return Ok(Some((decoded, value.clone()))),
                Err(err) => warn!(error = %err, "leaving entry with undecodable key in place"),
            }
        }
    }

    /// Raw key of the entry the cursor is on.
    pub(crate) fn current_key(&self) -> Option<&[u8]> {
        self.scan.current_key()
    }

    /// Stage deletion of the current entry.
    pub(crate) fn delete(&mut self) {
        if let Some(key) = self.scan.current_key() {
            self.pending.push(BatchOp::Delete(key.to_vec()));
        }
    }

    pub(crate) fn staged(&self) -> usize {
        self.pending.len()
    }

    /// Write all staged deletions atomically.
    pub(crate) fn commit(self) -> Result<usize, ChangelogError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        self.handle
            .store()
            .write_batch(self.handle.keyspace(), &self.pending)
            .map_err(|err| self.handle.fail(err))?;
        Ok(self.pending.len())
    }

    /// Drop staged deletions without writing them.
    pub(crate) fn abort(mut self) {
        self.pending.clear();
    }
}

/// Walk the keyspace from its first key and delete what `verdict` selects,
/// `batch_size` deletions per transaction, for at most `max_batches`
/// transactions (unbounded when `None`).
///
/// The shared lock is taken per batch, so a shutdown can slip in between
/// batches; the walk stops as soon as the log is closed.
pub(crate) fn delete_in_batches<K: LogKey>(
    handle: &LogHandle,
    batch_size: usize,
    max_batches: Option<usize>,
    mut verdict: impl FnMut(&K, &[u8]) -> Verdict,
) -> Result<DeleteProgress, ChangelogError> {
    let batch_size = batch_size.max(1);
    let mut progress = DeleteProgress::default();
    let mut resume_after: Option<Vec<u8>> = None;
    let mut batches = 0usize;

    while max_batches.map_or(true, |max| batches < max) {
        let _shared = handle.shared();
        if handle.is_closed() {
            break;
        }
        batches += 1;

        let mut cursor = DeleteCursor::<K>::open(handle, resume_after.take());
        let walked = stage_batch(&mut cursor, batch_size, &mut verdict);
        let reached_end = match walked {
            Ok(reached_end) => reached_end,
            Err(err) => {
                cursor.abort();
                return Err(err);
            }
        };
        resume_after = cursor.current_key().map(<[u8]>::to_vec);
        let deleted = cursor.commit()?;
        progress.deleted += deleted as u64;
        debug!(keyspace = handle.keyspace(), batch = batches, deleted, "delete batch committed");

        if reached_end {
            progress.finished = true;
            break;
        }
    }
    Ok(progress)
}

/// Stage up to `batch_size` deletions. Returns true when the walk hit a
/// stop condition or the end of the keyspace.
fn stage_batch<K: LogKey>(
    cursor: &mut DeleteCursor<'_, K>,
    batch_size: usize,
    verdict: &mut impl FnMut(&K, &[u8]) -> Verdict,
) -> Result<bool, ChangelogError> {
    while cursor.staged() < batch_size {
        let Some((key, value)) = cursor.next()? else {
            return Ok(true);
        };
        match verdict(&key, &value) {
            Verdict::Delete => cursor.delete(),
            Verdict::Keep => {}
            Verdict::Stop => return Ok(true),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{MemoryStore, OrderedStore};

    fn handle_with(keys: std::ops::RangeInclusive<u64>) -> (Arc<MemoryStore>, LogHandle) {
        let store = Arc::new(MemoryStore::new());
        let handle = LogHandle::open(store.clone(), "ks").unwrap();
        for key in keys {
            store.put("ks", &key.to_key_bytes(), b"").unwrap();
        }
        (store, handle)
    }

    #[test]
    fn deletes_in_bounded_batches() {
        let (store, handle) = handle_with(1..=20);

        let progress = delete_in_batches::<u64>(&handle, 3, Some(2), |key, _| {
            if *key < 15 {
                Verdict::Delete
            } else {
                Verdict::Stop
            }
        })
        .unwrap();

        assert_eq!(progress.deleted, 6);
        assert!(!progress.finished);
        assert_eq!(store.key_count("ks"), 14);

        let progress = delete_in_batches::<u64>(&handle, 3, None, |key, _| {
            if *key < 15 {
                Verdict::Delete
            } else {
                Verdict::Stop
            }
        })
        .unwrap();
        assert_eq!(progress.deleted, 8);
        assert!(progress.finished);
        assert_eq!(store.key_count("ks"), 6);
    }

    #[test]
    fn kept_entries_are_walked_past() {
        let (store, handle) = handle_with(1..=10);

        let progress = delete_in_batches::<u64>(&handle, 2, None, |key, _| {
            if key % 2 == 0 {
                Verdict::Delete
            } else {
                Verdict::Keep
            }
        })
        .unwrap();

        assert_eq!(progress.deleted, 5);
        assert!(progress.finished);
        assert_eq!(store.key_count("ks"), 5);
        assert_eq!(store.get("ks", &2u64.to_key_bytes()).unwrap(), None);
    }

    #[test]
    fn aborted_cursor_writes_nothing() {
        let (store, handle) = handle_with(1..=3);

        let mut cursor = DeleteCursor::<u64>::open(&handle, None);
        assert!(cursor.next().unwrap().is_some());
        cursor.delete();
        assert_eq!(cursor.staged(), 1);
        cursor.abort();

        assert_eq!(store.key_count("ks"), 3);
    }

    #[test]
    fn closed_log_is_not_touched() {
        let (store, handle) = handle_with(1..=3);
        handle.mark_closed();

        let progress =
            delete_in_batches::<u64>(&handle, 10, None, |_, _| Verdict::Delete).unwrap();

        assert_eq!(progress, DeleteProgress::default());
        assert_eq!(store.key_count("ks"), 3);
    }
}
