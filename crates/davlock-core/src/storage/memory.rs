//! In-memory lock store
//!
//! Transactions work on a staged copy of the lock map while holding the
//! map's mutex; commit swaps the copy in, drop discards it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::locking::{ActiveLock, LockStore, LockTransaction};
use crate::error::{Error, Result};

use super::json;

/// Lock records keyed by state token
pub(crate) type LockMap = HashMap<String, ActiveLock>;

/// Lock store keeping everything in process memory
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockStore {
    locks: Arc<Mutex<LockMap>>,
}

impl InMemoryLockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `locks`
    pub fn with_locks(locks: impl IntoIterator<Item = ActiveLock>) -> Self {
        let map = locks
            .into_iter()
            .map(|lock| (lock.state_token.clone(), lock))
            .collect();
        Self {
            locks: Arc::new(Mutex::new(map)),
        }
    }

    /// Committed locks, expired ones included
    pub async fn snapshot(&self) -> Vec<ActiveLock> {
        self.locks.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn begin(&self) -> Result<Box<dyn LockTransaction>> {
        let committed = Arc::clone(&self.locks).lock_owned().await;
        Ok(Box::new(SnapshotTransaction::new(committed, None)))
    }
}

/// Transaction over a mutex-guarded map, optionally persisted to a JSON file
pub(crate) struct SnapshotTransaction {
    committed: OwnedMutexGuard<LockMap>,
    staged: LockMap,
    persist_to: Option<PathBuf>,
}

impl SnapshotTransaction {
    pub(crate) fn new(committed: OwnedMutexGuard<LockMap>, persist_to: Option<PathBuf>) -> Self {
        let staged = committed.clone();
        Self {
            committed,
            staged,
            persist_to,
        }
    }
}

#[async_trait]
impl LockTransaction for SnapshotTransaction {
    async fn list_active_locks(&mut self) -> Result<Vec<ActiveLock>> {
        let mut locks: Vec<ActiveLock> = self.staged.values().cloned().collect();
        locks.sort_by(|a, b| a.issued.cmp(&b.issued).then_with(|| a.state_token.cmp(&b.state_token)));
        Ok(locks)
    }

    async fn add(&mut self, lock: &ActiveLock) -> Result<()> {
        if self.staged.contains_key(&lock.state_token) {
            return Err(Error::InvalidInput(format!(
                "lock {} already exists",
                lock.state_token
            )));
        }
        self.staged.insert(lock.state_token.clone(), lock.clone());
        Ok(())
    }

    async fn update(&mut self, lock: &ActiveLock) -> Result<()> {
        match self.staged.get_mut(&lock.state_token) {
            Some(existing) => {
                *existing = lock.clone();
                Ok(())
            }
            None => Err(Error::Other(format!("lock {} does not exist", lock.state_token))),
        }
    }

    async fn remove(&mut self, state_token: &str) -> Result<bool> {
        Ok(self.staged.remove(state_token).is_some())
    }

    async fn get(&mut self, state_token: &str) -> Result<Option<ActiveLock>> {
        Ok(self.staged.get(state_token).cloned())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(path) = &self.persist_to {
            json::write_document(path, &self.staged).await?;
        }
        *self.committed = std::mem::take(&mut self.staged);
        Ok(())
    }
}
