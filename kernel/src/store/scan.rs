// Stateful scan over one keyspace.

use std::sync::Arc;

use super::{Entry, OrderedStore, Seek, StoreError};

/// Scan handle that remembers the entry it is parked on.
///
/// Moving the scan re-reads the store relative to the current key, so
/// committed writes are always visible. If the current entry has been
/// deleted by someone else, the scan has lost its position: it reports the
/// end and stays unpositioned until `position` is called again.
#[derive(Debug)]
pub struct StoreScan {
    store: Arc<dyn OrderedStore>,
    keyspace: String,
    current: Option<Entry>,
}

impl StoreScan {
    pub fn new(store: Arc<dyn OrderedStore>, keyspace: impl Into<String>) -> Self {
        Self {
            store,
            keyspace: keyspace.into(),
            current: None,
        }
    }

    /// Park the scan on the entry selected by `seek`.
    pub fn position(&mut self, seek: Seek<'_>) -> Result<bool, StoreError> {
        self.current = self.store.seek(&self.keyspace, seek)?;
        Ok(self.current.is_some())
    }

    pub fn next(&mut self) -> Result<bool, StoreError> {
        self.step(|key| Seek::After(key))
    }

    pub fn prev(&mut self) -> Result<bool, StoreError> {
        self.step(|key| Seek::Before(key))
    }

    pub fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    pub fn current_key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(key, _)| key.as_slice())
    }

    fn step(&mut self, direction: impl Fn(&[u8]) -> Seek<'_>) -> Result<bool, StoreError> {
        let Some((key, _)) = self.current.take() else {
            return Ok(false);
        };
        if self.store.get(&self.keyspace, &key)?.is_none() {
            return Ok(false);
        }
        self.current = self.store.seek(&self.keyspace, direction(&key))?;
        Ok(self.current.is_some())
    }
}
