// Changelog Environment
//
// Owns the ordered store and every log kept in it: one replica log per
// (domain, replica id) and the process-wide change-number index. Replica
// logs found in the store are reopened at startup; new ones are created on
// the first append for their domain and replica.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ChangelogConfig;
use crate::csn::Csn;
use crate::index::{ChangeNumberIndex, ChangeNumberRecord, INDEX_KEYSPACE};
use crate::log::{keyspace_name, ChangelogError, ReplicaLog, UpdateRecord};
use crate::store::OrderedStore;

type LogId = (String, u16);

/// Oldest surviving positions after one purge pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// `(domain, replica_id, oldest csn)` for every replica log purged.
    pub replica_logs: Vec<(String, u16, Option<Csn>)>,
    /// Replica logs that are closed or failed to purge.
    pub skipped: Vec<(String, u16)>,
    pub index_oldest: Option<ChangeNumberRecord>,
}

#[derive(Debug)]
pub struct ChangelogEnv {
    store: Arc<dyn OrderedStore>,
    config: ChangelogConfig,
    logs: RwLock<BTreeMap<LogId, Arc<ReplicaLog>>>,
    index: ChangeNumberIndex,
}

impl ChangelogEnv {
    pub fn open(store: Arc<dyn OrderedStore>, config: ChangelogConfig) -> Result<Self, ChangelogError> {
        let mut logs = BTreeMap::new();
        for keyspace in store.keyspaces()? {
            if keyspace == INDEX_KEYSPACE {
                continue;
            }
            let Some((domain, replica_id)) = parse_keyspace_name(&keyspace) else {
                warn!(keyspace = %keyspace, "ignoring keyspace with unexpected name");
                continue;
            };
            let log = ReplicaLog::open(store.clone(), domain, replica_id, config.clone())?;
            logs.insert((domain.to_string(), replica_id), Arc::new(log));
        }
        let index = ChangeNumberIndex::open(store.clone(), config.clone())?;

        info!(replica_logs = logs.len(), "changelog environment opened");
        Ok(Self {
            store,
            config,
            logs: RwLock::new(logs),
            index,
        })
    }

    /// Append `update` to the log of its originating replica and index it.
    /// Returns the change number assigned to the update.
    pub fn append(&self, domain: &str, update: &UpdateRecord) -> Result<u64, ChangelogError> {
        let log = self.get_or_open(domain, update.csn.replica_id)?;
        log.append(update)?;
        self.index.append(domain, update.csn)
    }

    pub fn replica_log(&self, domain: &str, replica_id: u16) -> Option<Arc<ReplicaLog>> {
        self.logs
            .read()
            .get(&(domain.to_string(), replica_id))
            .cloned()
    }

    /// Every replica log of `domain`, ordered by replica id.
    pub fn replica_logs(&self, domain: &str) -> Vec<Arc<ReplicaLog>> {
        self.logs
            .read()
            .iter()
            .filter(|((log_domain, _), _)| log_domain == domain)
            .map(|(_, log)| log.clone())
            .collect()
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .logs
            .read()
            .keys()
            .map(|(domain, _)| domain.clone())
            .collect();
        domains.dedup();
        domains
    }

    pub fn index(&self) -> &ChangeNumberIndex {
        &self.index
    }

    /// One purge call on every replica log and on the index. A replica log
    /// that is closed or fails is reported as skipped; the others and the
    /// index are purged regardless.
    pub fn purge_up_to(&self, threshold: Csn) -> Result<PurgeReport, ChangelogError> {
        let logs: Vec<Arc<ReplicaLog>> = self.logs.read().values().cloned().collect();
        let mut replica_logs = Vec::with_capacity(logs.len());
        let mut skipped = Vec::new();
        for log in logs {
            let id = (log.domain().to_string(), log.replica_id());
            if log.is_closed() {
                skipped.push(id);
                continue;
            }
            match log.purge_up_to(threshold) {
                Ok(oldest) => replica_logs.push((id.0, id.1, oldest)),
                Err(err) => {
                    error!(domain = %id.0, replica_id = id.1, error = %err, "replica log purge failed");
                    skipped.push(id);
                }
            }
        }
        let index_oldest = self.index.purge_up_to(threshold)?;

        Ok(PurgeReport {
            replica_logs,
            skipped,
            index_oldest,
        })
    }

    /// Decommission `domain`: its replica logs are shut down and their
    /// keyspaces dropped, and its change-number index entries removed.
    ///
    /// A log whose keyspace cannot be dropped stays registered (closed) so a
    /// later call can retry it. Every step is attempted; the first error is
    /// returned.
    pub fn remove_domain(&self, domain: &str) -> Result<(), ChangelogError> {
        let mut first_error = None;
        let mut removed = 0usize;

        for log in self.replica_logs(domain) {
            log.shutdown();
            match self.store.drop_keyspace(log.keyspace()) {
                Ok(()) => {
                    self.logs
                        .write()
                        .remove(&(domain.to_string(), log.replica_id()));
                    removed += 1;
                }
                Err(err) => {
                    error!(
                        domain,
                        replica_id = log.replica_id(),
                        error = %err,
                        "failed to drop replica log keyspace"
                    );
                    first_error.get_or_insert(ChangelogError::from(err));
                }
            }
        }

        let index_entries = match self.index.remove_domain(domain) {
            Ok(count) => count,
            Err(err) => {
                error!(domain, error = %err, "failed to remove domain from change number index");
                first_error.get_or_insert(err);
                0
            }
        };
        if let Some(err) = first_error {
            return Err(err);
        }

        info!(domain, replica_logs = removed, index_entries, "domain removed");
        Ok(())
    }

    /// Shut every log down, then close the store.
    pub fn shutdown(&self) -> Result<(), ChangelogError> {
        for log in self.logs.read().values() {
            log.shutdown();
        }
        self.index.shutdown();
        self.store.close().map_err(|err| {
            error!(error = %err, "failed to close store");
            ChangelogError::from(err)
        })
    }

    fn get_or_open(&self, domain: &str, replica_id: u16) -> Result<Arc<ReplicaLog>, ChangelogError> {
        if let Some(log) = self.replica_log(domain, replica_id) {
            return Ok(log);
        }
        let mut logs = self.logs.write();
        if let Some(log) = logs.get(&(domain.to_string(), replica_id)) {
            return Ok(log.clone());
        }
        let log = Arc::new(ReplicaLog::open(
            self.store.clone(),
            domain,
            replica_id,
            self.config.clone(),
        )?);
        logs.insert((domain.to_string(), replica_id), log.clone());
        Ok(log)
    }
}

/// Inverse of [`keyspace_name`]. Domains may contain `:`, replica ids not.
fn parse_keyspace_name(keyspace: &str) -> Option<(&str, u16)> {
    let (replica_id, domain) = keyspace.split_once(':')?;
    let replica_id = replica_id.parse().ok()?;
    (keyspace_name(domain, replica_id) == keyspace).then_some((domain, replica_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{MatchStrategy, PositionStrategy};
    use crate::store::{BatchOp, Entry, MemoryStore, Seek, StoreError};

    /// Memory store whose `drop_keyspace` fails for one chosen keyspace.
    #[derive(Debug, Default)]
    struct DropRefusingStore {
        inner: MemoryStore,
        refuse: parking_lot::Mutex<Option<String>>,
    }

    impl OrderedStore for DropRefusingStore {
        fn create_keyspace(&self, name: &str) -> Result<(), StoreError> {
            self.inner.create_keyspace(name)
        }

        fn drop_keyspace(&self, name: &str) -> Result<(), StoreError> {
            if self.refuse.lock().as_deref() == Some(name) {
                return Err(StoreError::Backend(format!("cannot drop {name}")));
            }
            self.inner.drop_keyspace(name)
        }

        fn keyspaces(&self) -> Result<Vec<String>, StoreError> {
            self.inner.keyspaces()
        }

        fn get(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(keyspace, key)
        }

        fn put(&self, keyspace: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.inner.put(keyspace, key, value)
        }

        fn write_batch(&self, keyspace: &str, batch: &[BatchOp]) -> Result<(), StoreError> {
            self.inner.write_batch(keyspace, batch)
        }

        fn seek(&self, keyspace: &str, seek: Seek<'_>) -> Result<Option<Entry>, StoreError> {
            self.inner.seek(keyspace, seek)
        }

        fn is_valid(&self) -> bool {
            self.inner.is_valid()
        }

        fn close(&self) -> Result<(), StoreError> {
            self.inner.close()
        }
    }

    fn index_numbers(env: &ChangelogEnv) -> Vec<u64> {
        env.index()
            .open_cursor(None, MatchStrategy::EqualTo, PositionStrategy::OnMatchingKey)
            .map(|record| record.unwrap().change_number)
            .collect()
    }

    fn update(time: u64, replica_id: u16) -> UpdateRecord {
        UpdateRecord::new(Csn::new(time, replica_id, 0), b"change".to_vec())
    }

    fn open(store: &Arc<MemoryStore>) -> ChangelogEnv {
        ChangelogEnv::open(store.clone(), ChangelogConfig::default_config()).unwrap()
    }

    #[test]
    fn keyspace_names_round_trip() {
        assert_eq!(parse_keyspace_name("7:dc=example,dc=com"), Some(("dc=example,dc=com", 7)));
        assert_eq!(parse_keyspace_name("3:cn=a:b"), Some(("cn=a:b", 3)));
        assert_eq!(parse_keyspace_name("changenumberindex"), None);
        assert_eq!(parse_keyspace_name("x:o=a"), None);
        assert_eq!(parse_keyspace_name("07:o=a"), None);
    }

    #[test]
    fn appends_are_routed_per_replica_and_indexed() {
        let store = Arc::new(MemoryStore::new());
        let env = open(&store);

        assert_eq!(env.append("o=a", &update(1, 1)).unwrap(), 1);
        assert_eq!(env.append("o=a", &update(2, 2)).unwrap(), 2);
        assert_eq!(env.append("o=b", &update(3, 1)).unwrap(), 3);

        assert_eq!(env.domains(), vec!["o=a".to_string(), "o=b".to_string()]);
        assert_eq!(env.replica_logs("o=a").len(), 2);
        let log = env.replica_log("o=a", 2).unwrap();
        assert_eq!(log.newest_csn(), Some(Csn::new(2, 2, 0)));
        assert_eq!(env.index().get(3).unwrap().unwrap().domain, "o=b");
    }

    #[test]
    fn reopen_finds_existing_logs() {
        let store = Arc::new(MemoryStore::new());
        {
            let env = open(&store);
            env.append("o=a", &update(1, 1)).unwrap();
            env.append("o=a", &update(2, 4)).unwrap();
        }

        let env = open(&store);
        assert_eq!(env.replica_logs("o=a").len(), 2);
        assert_eq!(
            env.replica_log("o=a", 4).unwrap().oldest_csn(),
            Some(Csn::new(2, 4, 0))
        );
        assert_eq!(env.append("o=a", &update(3, 1)).unwrap(), 3);
    }

    #[test]
    fn purge_covers_every_log() {
        let store = Arc::new(MemoryStore::new());
        let env = open(&store);
        for time in 1..=5 {
            env.append("o=a", &update(time, 1)).unwrap();
            env.append("o=b", &update(time, 2)).unwrap();
        }

        let report = env.purge_up_to(Csn::new(4, 0, 1)).unwrap();

        assert_eq!(
            report.replica_logs,
            vec![
                ("o=a".to_string(), 1, Some(Csn::new(4, 1, 0))),
                ("o=b".to_string(), 2, Some(Csn::new(4, 2, 0))),
            ]
        );
        assert!(report.skipped.is_empty());
        assert_eq!(report.index_oldest.unwrap().change_number, 7);
    }

    #[test]
    fn remove_domain_drops_its_logs_and_index_entries() {
        let store = Arc::new(MemoryStore::new());
        let env = open(&store);
        env.append("o=a", &update(1, 1)).unwrap();
        env.append("o=b", &update(2, 1)).unwrap();
        env.append("o=a", &update(3, 1)).unwrap();
        let stale = env.replica_log("o=a", 1).unwrap();

        env.remove_domain("o=a").unwrap();

        assert!(env.replica_log("o=a", 1).is_none());
        assert!(stale.is_closed());
        assert!(!store
            .keyspaces()
            .unwrap()
            .contains(&keyspace_name("o=a", 1)));
        // entry 3 is the newest overall and stays
        assert_eq!(index_numbers(&env), vec![2, 3]);
    }

    #[test]
    fn failed_keyspace_drop_keeps_the_log_registered() {
        let store = Arc::new(DropRefusingStore::default());
        let env = ChangelogEnv::open(store.clone(), ChangelogConfig::default_config()).unwrap();
        env.append("o=a", &update(1, 1)).unwrap();
        env.append("o=a", &update(2, 2)).unwrap();
        env.append("o=b", &update(3, 1)).unwrap();
        *store.refuse.lock() = Some(keyspace_name("o=a", 1));

        assert!(matches!(
            env.remove_domain("o=a"),
            Err(ChangelogError::Store(StoreError::Backend(_)))
        ));

        // the other replica log and the index entries are still removed
        assert!(env.replica_log("o=a", 2).is_none());
        assert_eq!(index_numbers(&env), vec![3]);
        let kept = env.replica_log("o=a", 1).unwrap();
        assert!(kept.is_closed());
        assert!(store.keyspaces().unwrap().contains(&keyspace_name("o=a", 1)));

        *store.refuse.lock() = None;
        env.remove_domain("o=a").unwrap();
        assert!(env.replica_logs("o=a").is_empty());
        assert!(!store.keyspaces().unwrap().contains(&keyspace_name("o=a", 1)));
    }

    #[test]
    fn purge_skips_closed_logs() {
        let store = Arc::new(MemoryStore::new());
        let env = open(&store);
        for time in 1..=5 {
            env.append("o=a", &update(time, 1)).unwrap();
            env.append("o=b", &update(time, 2)).unwrap();
        }
        env.replica_log("o=a", 1).unwrap().shutdown();

        let report = env.purge_up_to(Csn::new(4, 0, 1)).unwrap();

        assert_eq!(
            report.replica_logs,
            vec![("o=b".to_string(), 2, Some(Csn::new(4, 2, 0)))]
        );
        assert_eq!(report.skipped, vec![("o=a".to_string(), 1)]);
        assert_eq!(report.index_oldest.unwrap().change_number, 7);
        assert_eq!(
            env.replica_log("o=a", 1).unwrap().oldest_csn(),
            Some(Csn::new(1, 1, 0))
        );
    }

    #[test]
    fn shutdown_closes_logs_and_store() {
        let store = Arc::new(MemoryStore::new());
        let env = open(&store);
        env.append("o=a", &update(1, 1)).unwrap();

        env.shutdown().unwrap();

        assert!(env.replica_log("o=a", 1).unwrap().is_closed());
        assert!(env.index().is_closed());
        assert!(!store.is_valid());
        assert!(matches!(
            env.append("o=a", &update(2, 1)),
            Err(ChangelogError::Closed)
        ));
    }
}
