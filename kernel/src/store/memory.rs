// In-memory ordered store, one BTreeMap per keyspace.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::RwLock;

use super::{BatchOp, Entry, OrderedStore, Seek, StoreError};

type Keyspace = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
struct Inner {
    keyspaces: HashMap<String, Keyspace>,
    closed: bool,
}

/// Volatile [`OrderedStore`]. Sharing one instance between two environments
/// behaves like reopening the same database after a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in a keyspace, counter records included.
    pub fn key_count(&self, keyspace: &str) -> usize {
        self.inner
            .read()
            .keyspaces
            .get(keyspace)
            .map_or(0, BTreeMap::len)
    }
}

fn open(inner: &Inner) -> Result<(), StoreError> {
    if inner.closed {
        Err(StoreError::Closed)
    } else {
        Ok(())
    }
}

fn keyspace<'a>(inner: &'a Inner, name: &str) -> Result<&'a Keyspace, StoreError> {
    open(inner)?;
    inner
        .keyspaces
        .get(name)
        .ok_or_else(|| StoreError::MissingKeyspace(name.to_string()))
}

fn keyspace_mut<'a>(inner: &'a mut Inner, name: &str) -> Result<&'a mut Keyspace, StoreError> {
    open(inner)?;
    inner
        .keyspaces
        .get_mut(name)
        .ok_or_else(|| StoreError::MissingKeyspace(name.to_string()))
}

fn owned((key, value): (&Vec<u8>, &Vec<u8>)) -> Entry {
    (key.clone(), value.clone())
}

impl OrderedStore for MemoryStore {
    fn create_keyspace(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        open(&inner)?;
        inner.keyspaces.entry(name.to_string()).or_default();
        Ok(())
    }

    fn drop_keyspace(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        open(&inner)?;
        inner.keyspaces.remove(name);
        Ok(())
    }

    fn keyspaces(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read();
        open(&inner)?;
        let mut names: Vec<String> = inner.keyspaces.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn get(&self, keyspace_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read();
        Ok(keyspace(&inner, keyspace_name)?.get(key).cloned())
    }

    fn put(&self, keyspace_name: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        keyspace_mut(&mut inner, keyspace_name)?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, keyspace_name: &str, batch: &[BatchOp]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let keyspace = keyspace_mut(&mut inner, keyspace_name)?;
        for op in batch {
            match op {
                BatchOp::Put(key, value) => {
                    keyspace.insert(key.clone(), value.clone());
                }
                BatchOp::Delete(key) => {
                    keyspace.remove(key);
                }
            }
        }
        Ok(())
    }

    fn seek(&self, keyspace_name: &str, seek: Seek<'_>) -> Result<Option<Entry>, StoreError> {
        let inner = self.inner.read();
        let keyspace = keyspace(&inner, keyspace_name)?;
        let found = match seek {
            Seek::First => keyspace.iter().next(),
            Seek::Last => keyspace.iter().next_back(),
            Seek::Exact(key) => keyspace.get_key_value(key),
            Seek::AtOrAfter(key) => keyspace
                .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .next(),
            Seek::After(key) => keyspace
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .next(),
            Seek::AtOrBefore(key) => keyspace
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back(),
            Seek::Before(key) => keyspace
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back(),
        };
        Ok(found.map(owned))
    }

    fn is_valid(&self) -> bool {
        !self.inner.read().closed
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.keyspaces.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(keys: &[&[u8]]) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_keyspace("ks").unwrap();
        for key in keys {
            store.put("ks", key, b"v").unwrap();
        }
        store
    }

    fn key_of(entry: Option<Entry>) -> Option<Vec<u8>> {
        entry.map(|(key, _)| key)
    }

    #[test]
    fn seek_variants() {
        let store = store_with(&[b"b", b"d", b"f"]);

        assert_eq!(key_of(store.seek("ks", Seek::First).unwrap()), Some(b"b".to_vec()));
        assert_eq!(key_of(store.seek("ks", Seek::Last).unwrap()), Some(b"f".to_vec()));
        assert_eq!(key_of(store.seek("ks", Seek::Exact(b"c")).unwrap()), None);
        assert_eq!(
            key_of(store.seek("ks", Seek::AtOrAfter(b"c")).unwrap()),
            Some(b"d".to_vec())
        );
        assert_eq!(
            key_of(store.seek("ks", Seek::After(b"d")).unwrap()),
            Some(b"f".to_vec())
        );
        assert_eq!(
            key_of(store.seek("ks", Seek::AtOrBefore(b"e")).unwrap()),
            Some(b"d".to_vec())
        );
        assert_eq!(key_of(store.seek("ks", Seek::Before(b"b")).unwrap()), None);
    }

    #[test]
    fn batch_is_applied_as_a_whole() {
        let store = store_with(&[b"a", b"b"]);
        store
            .write_batch(
                "ks",
                &[
                    BatchOp::Delete(b"a".to_vec()),
                    BatchOp::Put(b"c".to_vec(), b"3".to_vec()),
                ],
            )
            .unwrap();

        assert_eq!(store.get("ks", b"a").unwrap(), None);
        assert_eq!(store.get("ks", b"c").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.key_count("ks"), 2);
    }

    #[test]
    fn missing_keyspace_is_reported() {
        let store = MemoryStore::new();
        assert_eq!(
            store.get("nope", b"k"),
            Err(StoreError::MissingKeyspace("nope".into()))
        );
    }

    #[test]
    fn closed_store_rejects_everything() {
        let store = store_with(&[b"a"]);
        store.close().unwrap();

        assert!(!store.is_valid());
        assert_eq!(store.get("ks", b"a"), Err(StoreError::Closed));
        assert_eq!(store.create_keyspace("other"), Err(StoreError::Closed));
    }
}
