//! Storage for peer records.
//!
//! Both backends satisfy the same [`PeerStore`] contract. Neither locks on
//! its own; callers go through [`crate::registry::Registry`], which owns the
//! one lock every read-modify-write runs under.

mod file;
mod memory;

pub use file::FileBackedStore;
pub use memory::InMemoryStore;

use crate::peers::PeerRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no peer record for {0}")]
    NotFound(String),
    #[error("record keyed by one token but holding another")]
    TokenMismatch,
    #[error("peer store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer store is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("peer store task failed: {0}")]
    Task(String),
}

pub trait PeerStore: Send {
    fn get(&self, token: &str) -> Result<PeerRecord, StoreError>;

    /// Insert or overwrite the record under `token`.
    fn put(&mut self, token: &str, record: PeerRecord) -> Result<(), StoreError>;

    fn delete(&mut self, token: &str) -> Result<PeerRecord, StoreError>;

    fn list(&self) -> Result<Vec<PeerRecord>, StoreError>;

    /// Token of the peer carrying `group_id`.
    fn find_by_group_id(&self, group_id: &str) -> Result<String, StoreError>;

    /// Swap the record under `old_token` for `record` under its own token.
    fn replace(&mut self, old_token: &str, record: PeerRecord) -> Result<(), StoreError> {
        self.get(old_token)?;
        let token = record.local_token.clone();
        self.delete(old_token)?;
        self.put(&token, record)
    }
}

fn check_key(token: &str, record: &PeerRecord) -> Result<(), StoreError> {
    if record.local_token == token {
        Ok(())
    } else {
        Err(StoreError::TokenMismatch)
    }
}

#[cfg(test)]
mod contract_tests {
    //! Runs the same assertions against every backend.
    use super::*;

    fn record(token: &str, group: Option<&str>) -> PeerRecord {
        let mut record = PeerRecord::new(token, "remote", "http://peer/fp/2.0", "2.0");
        if let Some(group) = group {
            record.group_ids.insert(group.to_string());
        }
        record
    }

    fn exercise(store: &mut dyn PeerStore) {
        assert!(matches!(store.get("a"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("a"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.put("a", record("b", None)),
            Err(StoreError::TokenMismatch)
        ));

        store.put("a", record("a", Some("grid-1"))).unwrap();
        store.put("b", record("b", None)).unwrap();
        assert_eq!(store.get("a").unwrap().local_token, "a");
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.find_by_group_id("grid-1").unwrap(), "a");
        assert!(matches!(
            store.find_by_group_id("grid-2"),
            Err(StoreError::NotFound(_))
        ));

        store.replace("a", record("c", Some("grid-1"))).unwrap();
        assert!(matches!(store.get("a"), Err(StoreError::NotFound(_))));
        assert_eq!(store.find_by_group_id("grid-1").unwrap(), "c");
        assert!(matches!(
            store.replace("a", record("d", None)),
            Err(StoreError::NotFound(_))
        ));

        let removed = store.delete("b").unwrap();
        assert_eq!(removed.local_token, "b");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn in_memory_store_contract() {
        exercise(&mut InMemoryStore::new());
    }

    #[test]
    fn file_backed_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&mut FileBackedStore::new(dir.path().join("peers.json")));
    }
}
