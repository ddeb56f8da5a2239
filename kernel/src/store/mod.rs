// Ordered Store Abstraction
//
// Defines the contract the changelog needs from the embedded sorted
// key-value engine underneath it. Implementations may persist to disk
// or keep everything in memory.

use std::fmt;

pub mod memory;
#[cfg(feature = "rocks")]
pub mod rocks;
pub mod scan;

pub use memory::MemoryStore;
#[cfg(feature = "rocks")]
pub use rocks::RocksStore;
pub use scan::StoreScan;

/// A key and its value, as stored.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Failures reported by the ordered store.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("keyspace `{0}` does not exist")]
    MissingKeyspace(String),

    #[error("store corruption: {0}")]
    Corruption(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors after which the store cannot be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Closed | StoreError::Corruption(_))
    }
}

/// Where to position a lookup inside a keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek<'a> {
    First,
    Last,
    Exact(&'a [u8]),
    AtOrAfter(&'a [u8]),
    After(&'a [u8]),
    AtOrBefore(&'a [u8]),
    Before(&'a [u8]),
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Sorted key-value engine holding any number of named keyspaces.
///
/// Keys inside a keyspace are ordered bytewise. Implementations MUST:
/// - apply a `write_batch` atomically
/// - make a committed write visible to every later `seek`
/// - fail every call with `StoreError::Closed` once `close` has run
pub trait OrderedStore: Send + Sync + fmt::Debug {
    /// Create the keyspace if it does not exist yet.
    fn create_keyspace(&self, name: &str) -> Result<(), StoreError>;

    /// Remove the keyspace and everything in it. Missing keyspaces are ignored.
    fn drop_keyspace(&self, name: &str) -> Result<(), StoreError>;

    fn keyspaces(&self) -> Result<Vec<String>, StoreError>;

    fn get(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, keyspace: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn write_batch(&self, keyspace: &str, batch: &[BatchOp]) -> Result<(), StoreError>;

    /// Return the entry selected by `seek`, if any.
    fn seek(&self, keyspace: &str, seek: Seek<'_>) -> Result<Option<Entry>, StoreError>;

    /// False once the store has been closed or has failed irrecoverably.
    fn is_valid(&self) -> bool;

    fn close(&self) -> Result<(), StoreError>;
}
