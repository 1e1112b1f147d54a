use super::{check_key, PeerStore, StoreError};
use crate::peers::PeerRecord;
use std::collections::HashMap;

/// Process-local records; gone when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: HashMap<String, PeerRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerStore for InMemoryStore {
    fn get(&self, token: &str) -> Result<PeerRecord, StoreError> {
        self.records
            .get(token)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(token.to_string()))
    }

    fn put(&mut self, token: &str, record: PeerRecord) -> Result<(), StoreError> {
        check_key(token, &record)?;
        self.records.insert(token.to_string(), record);
        Ok(())
    }

    fn delete(&mut self, token: &str) -> Result<PeerRecord, StoreError> {
        self.records
            .remove(token)
            .ok_or_else(|| StoreError::NotFound(token.to_string()))
    }

    fn list(&self) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(self.records.values().cloned().collect())
    }

    fn find_by_group_id(&self, group_id: &str) -> Result<String, StoreError> {
        self.records
            .values()
            .find(|record| record.group_ids.contains(group_id))
            .map(|record| record.local_token.clone())
            .ok_or_else(|| StoreError::NotFound(group_id.to_string()))
    }
}
