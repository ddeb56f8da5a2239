// Changelog Kernel
//
// Durable, CSN-ordered replication change logs and the change-number index
// built on top of an embedded ordered key-value store.

pub mod config;
pub mod csn;
pub mod cursor;
pub mod env;
pub mod index;
pub mod log;
pub mod record;
pub mod store;
