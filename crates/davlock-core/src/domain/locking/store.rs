//! Store traits for lock persistence
//!
//! The lock manager talks to persistence exclusively through these traits.
//! Implementations live in [`crate::storage`] (in-memory map, SQLite table,
//! JSON document).

use async_trait::async_trait;

use crate::error::Result;

use super::types::ActiveLock;

/// A lock persistence backend
///
/// `begin` must not return while another transaction of the same store is
/// still open: every backend serializes its transactions so that a reader
/// always sees the committed state of all earlier transactions.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Open a new transaction, waiting for the previous one to finish
    async fn begin(&self) -> Result<Box<dyn LockTransaction>>;
}

/// An atomic unit of work over persisted lock records
///
/// Dropping a transaction without calling [`LockTransaction::commit`] rolls
/// back every change made through it.
#[async_trait]
pub trait LockTransaction: Send {
    /// All persisted locks, expired ones included
    async fn list_active_locks(&mut self) -> Result<Vec<ActiveLock>>;

    /// Insert a new lock
    async fn add(&mut self, lock: &ActiveLock) -> Result<()>;

    /// Replace an existing lock with the same state token
    async fn update(&mut self, lock: &ActiveLock) -> Result<()>;

    /// Remove a lock, returning whether it existed
    async fn remove(&mut self, state_token: &str) -> Result<bool>;

    /// Get a lock by state token
    async fn get(&mut self, state_token: &str) -> Result<Option<ActiveLock>>;

    /// Make every change visible to later transactions
    async fn commit(self: Box<Self>) -> Result<()>;
}
