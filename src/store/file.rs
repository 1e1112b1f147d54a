use super::{check_key, PeerStore, StoreError};
use crate::peers::PeerRecord;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

type Records = BTreeMap<String, PeerRecord>;

/// Records in a single JSON object keyed by local token.
///
/// Every operation reads the whole file and every mutation rewrites it, so
/// the file is the only state and survives restarts. Writes go to a temp
/// file that is renamed over the original. One process only.
#[derive(Debug, Clone)]
pub struct FileBackedStore {
    path: PathBuf,
}

impl FileBackedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Records, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Records::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(Records::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, records: &Records) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(records)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let tmp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut f = File::create(&tmp_path)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn mutate<R>(
        &self,
        change: impl FnOnce(&mut Records) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut records = self.load()?;
        let out = change(&mut records)?;
        self.save(&records)?;
        Ok(out)
    }
}

impl PeerStore for FileBackedStore {
    fn get(&self, token: &str) -> Result<PeerRecord, StoreError> {
        self.load()?
            .remove(token)
            .ok_or_else(|| StoreError::NotFound(token.to_string()))
    }

    fn put(&mut self, token: &str, record: PeerRecord) -> Result<(), StoreError> {
        check_key(token, &record)?;
        self.mutate(|records| {
            records.insert(token.to_string(), record);
            Ok(())
        })
    }

    fn delete(&mut self, token: &str) -> Result<PeerRecord, StoreError> {
        self.mutate(|records| {
            records
                .remove(token)
                .ok_or_else(|| StoreError::NotFound(token.to_string()))
        })
    }

    fn list(&self) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(self.load()?.into_values().collect())
    }

    fn find_by_group_id(&self, group_id: &str) -> Result<String, StoreError> {
        self.load()?
            .into_values()
            .find(|record| record.group_ids.contains(group_id))
            .map(|record| record.local_token)
            .ok_or_else(|| StoreError::NotFound(group_id.to_string()))
    }

    fn replace(&mut self, old_token: &str, record: PeerRecord) -> Result<(), StoreError> {
        self.mutate(|records| {
            records
                .remove(old_token)
                .ok_or_else(|| StoreError::NotFound(old_token.to_string()))?;
            records.insert(record.local_token.clone(), record);
            Ok(())
        })
    }
}
