// RocksDB implementation of the ordered store.
//
// Each keyspace is a column family. The database handle sits behind a lock
// so that `close` can release it while other threads still hold the store.

use std::path::Path;

use parking_lot::RwLock;
use rocksdb::{
    DBRawIteratorWithThreadMode, DBWithThreadMode, ErrorKind, MultiThreaded, Options, WriteBatch,
};

use super::{BatchOp, Entry, OrderedStore, Seek, StoreError};

type Db = DBWithThreadMode<MultiThreaded>;

const DEFAULT_COLUMN_FAMILY: &str = "default";

/// Persistent [`OrderedStore`] backed by RocksDB.
pub struct RocksStore {
    db: RwLock<Option<Db>>,
    path: String,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.path)
            .field("open", &self.db.read().is_some())
            .finish()
    }
}

fn map_err(err: rocksdb::Error) -> StoreError {
    match err.kind() {
        ErrorKind::Corruption => StoreError::Corruption(err.into_string()),
        _ => StoreError::Backend(err.into_string()),
    }
}

fn options() -> Options {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options
}

impl RocksStore {
    /// Open (or create) the database at `path` with all its column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = options();
        let column_families = Db::list_cf(&options, path)
            .unwrap_or_else(|_| vec![DEFAULT_COLUMN_FAMILY.to_string()]);
        let db = Db::open_cf(&options, path, &column_families).map_err(map_err)?;

        Ok(Self {
            db: RwLock::new(Some(db)),
            path: path.display().to_string(),
        })
    }

    fn with_db<T>(&self, f: impl FnOnce(&Db) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        f(db)
    }
}

fn entry_at(iter: &DBRawIteratorWithThreadMode<'_, Db>) -> Result<Option<Entry>, StoreError> {
    if iter.valid() {
        match (iter.key(), iter.value()) {
            (Some(key), Some(value)) => Ok(Some((key.to_vec(), value.to_vec()))),
            _ => Ok(None),
        }
    } else {
        iter.status().map_err(map_err)?;
        Ok(None)
    }
}

impl OrderedStore for RocksStore {
    fn create_keyspace(&self, name: &str) -> Result<(), StoreError> {
        self.with_db(|db| {
            if db.cf_handle(name).is_some() {
                return Ok(());
            }
            db.create_cf(name, &options()).map_err(map_err)
        })
    }

    fn drop_keyspace(&self, name: &str) -> Result<(), StoreError> {
        self.with_db(|db| {
            if db.cf_handle(name).is_none() {
                return Ok(());
            }
            db.drop_cf(name).map_err(map_err)
        })
    }

    fn keyspaces(&self) -> Result<Vec<String>, StoreError> {
        self.with_db(|_| {
            let mut names = Db::list_cf(&options(), &self.path).map_err(map_err)?;
            names.retain(|name| name != DEFAULT_COLUMN_FAMILY);
            names.sort();
            Ok(names)
        })
    }

    fn get(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| {
            let cf = db
                .cf_handle(keyspace)
                .ok_or_else(|| StoreError::MissingKeyspace(keyspace.to_string()))?;
            db.get_cf(&cf, key).map_err(map_err)
        })
    }

    fn put(&self, keyspace: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| {
            let cf = db
                .cf_handle(keyspace)
                .ok_or_else(|| StoreError::MissingKeyspace(keyspace.to_string()))?;
            db.put_cf(&cf, key, value).map_err(map_err)
        })
    }

    fn write_batch(&self, keyspace: &str, batch: &[BatchOp]) -> Result<(), StoreError> {
        self.with_db(|db| {
            let cf = db
                .cf_handle(keyspace)
                .ok_or_else(|| StoreError::MissingKeyspace(keyspace.to_string()))?;
            let mut wb = WriteBatch::default();
            for op in batch {
                match op {
                    BatchOp::Put(key, value) => wb.put_cf(&cf, key, value),
                    BatchOp::Delete(key) => wb.delete_cf(&cf, key),
                }
            }
            db.write(wb).map_err(map_err)
        })
    }

    fn seek(&self, keyspace: &str, seek: Seek<'_>) -> Result<Option<Entry>, StoreError> {
        self.with_db(|db| {
            let cf = db
                .cf_handle(keyspace)
                .ok_or_else(|| StoreError::MissingKeyspace(keyspace.to_string()))?;
            let mut iter = db.raw_iterator_cf(&cf);
            match seek {
                Seek::First => iter.seek_to_first(),
                Seek::Last => iter.seek_to_last(),
                Seek::Exact(key) => {
                    return Ok(db
                        .get_cf(&cf, key)
                        .map_err(map_err)?
                        .map(|value| (key.to_vec(), value)));
                }
                Seek::AtOrAfter(key) => iter.seek(key),
                Seek::After(key) => {
                    iter.seek(key);
                    if iter.valid() && iter.key() == Some(key) {
                        iter.next();
                    }
                }
                Seek::AtOrBefore(key) => iter.seek_for_prev(key),
                Seek::Before(key) => {
                    iter.seek_for_prev(key);
                    if iter.valid() && iter.key() == Some(key) {
                        iter.prev();
                    }
                }
            }
            entry_at(&iter)
        })
    }

    fn is_valid(&self) -> bool {
        self.db.read().is_some()
    }

    fn close(&self) -> Result<(), StoreError> {
        if let Some(db) = self.db.write().take() {
            db.flush().map_err(map_err)?;
        }
        Ok(())
    }
}
