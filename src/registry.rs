use crate::peers::PeerRecord;
use crate::store::{PeerStore, StoreError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task;

/// The peer registry: one store behind one process-wide lock.
///
/// Inbound handlers and the scheduler both mutate through here. Each method
/// is a complete critical section; nothing awaits while the lock is held.
/// Two writers touching the same field are last-writer-wins.
pub struct Registry {
    store: Mutex<Box<dyn PeerStore>>,
}

impl Registry {
    pub fn new(store: impl PeerStore + 'static) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn PeerStore>> {
        // A panic mid-section cannot leave a half-applied record behind,
        // records are only ever written whole.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, token: &str) -> Result<PeerRecord, StoreError> {
        self.lock().get(token)
    }

    pub fn contains(&self, token: &str) -> Result<bool, StoreError> {
        match self.lock().get(token) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn insert(&self, record: PeerRecord) -> Result<(), StoreError> {
        let token = record.local_token.clone();
        self.lock().put(&token, record)
    }

    pub fn remove(&self, token: &str) -> Result<PeerRecord, StoreError> {
        self.lock().delete(token)
    }

    pub fn snapshot(&self) -> Result<Vec<PeerRecord>, StoreError> {
        self.lock().list()
    }

    pub fn find_by_group_id(&self, group_id: &str) -> Result<PeerRecord, StoreError> {
        let store = self.lock();
        let token = store.find_by_group_id(group_id)?;
        store.get(&token)
    }

    /// Read, change and write back one record as a single step.
    pub fn update<R>(
        &self,
        token: &str,
        change: impl FnOnce(&mut PeerRecord) -> R,
    ) -> Result<R, StoreError> {
        let mut store = self.lock();
        let mut record = store.get(token)?;
        let out = change(&mut record);
        store.put(token, record)?;
        Ok(out)
    }

    /// Retire the record under `old_token` in favour of the one `build`
    /// derives from it, as a single step.
    pub fn replace(
        &self,
        old_token: &str,
        build: impl FnOnce(PeerRecord) -> PeerRecord,
    ) -> Result<PeerRecord, StoreError> {
        let mut store = self.lock();
        let old = store.get(old_token)?;
        let record = build(old);
        store.replace(old_token, record.clone())?;
        Ok(record)
    }

    /// Attach `group_id` to `token`, detaching it from whichever peer held it.
    pub fn link_group(&self, token: &str, group_id: &str) -> Result<(), StoreError> {
        let mut store = self.lock();
        let mut record = store.get(token)?;
        match store.find_by_group_id(group_id) {
            Ok(holder) if holder != token => {
                let mut previous = store.get(&holder)?;
                previous.group_ids.remove(group_id);
                store.put(&holder, previous)?;
            }
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        record.group_ids.insert(group_id.to_string());
        store.put(token, record)
    }
}

/// Run a registry call on the blocking pool.
///
/// Async callers go through here: a file-backed store reads, rewrites and
/// syncs the whole file under the registry lock, which must not happen on a
/// runtime worker.
pub async fn blocking<R, E>(
    call: impl FnOnce() -> Result<R, E> + Send + 'static,
) -> Result<R, E>
where
    R: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    match task::spawn_blocking(call).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Task(e.to_string()).into()),
    }
}
