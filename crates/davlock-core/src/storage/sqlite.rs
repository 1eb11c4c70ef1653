//! SQLite lock store
//!
//! Locks live in the `active_locks` table. Each store transaction is one sqlx
//! transaction, opened only after the store's gate has been acquired.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::locking::{ActiveLock, LockStore, LockTimeout, LockTransaction};
use crate::error::{Error, Result};

use super::Database;

const SELECT_COLUMNS: &str = "SELECT state_token, path, href, recursive, owner, access_type, \
     share_mode, timeout_ms, issued, last_refresh, expiration FROM active_locks";

/// Lock store backed by a migrated SQLite database
#[derive(Debug, Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
    gate: Arc<Mutex<()>>,
}

impl SqliteLockStore {
    /// Create a store over a pool whose schema is already migrated
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Create a store over an opened [`Database`]
    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn begin(&self) -> Result<Box<dyn LockTransaction>> {
        let gate = Arc::clone(&self.gate).lock_owned().await;
        let tx = self.pool.begin().await.map_err(Error::DatabaseError)?;
        Ok(Box::new(SqliteLockTransaction { tx, _gate: gate }))
    }
}

/// sqlx transaction plus the gate guard; both are released on commit or drop
struct SqliteLockTransaction {
    tx: Transaction<'static, Sqlite>,
    _gate: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockTransaction for SqliteLockTransaction {
    async fn list_active_locks(&mut self) -> Result<Vec<ActiveLock>> {
        let rows: Vec<ActiveLockRow> =
            sqlx::query_as(&format!("{} ORDER BY issued, state_token", SELECT_COLUMNS))
                .fetch_all(&mut *self.tx)
                .await
                .map_err(Error::DatabaseError)?;

        rows.into_iter().map(ActiveLockRow::into_active_lock).collect()
    }

    async fn add(&mut self, lock: &ActiveLock) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO active_locks (
                state_token, path, href, recursive, owner, access_type,
                share_mode, timeout_ms, issued, last_refresh, expiration
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&lock.state_token)
        .bind(&lock.path)
        .bind(&lock.href)
        .bind(lock.recursive)
        .bind(&lock.owner)
        .bind(lock.access_type.as_str())
        .bind(lock.share_mode.as_str())
        .bind(lock.timeout.to_millis())
        .bind(lock.issued)
        .bind(lock.last_refresh)
        .bind(lock.expiration)
        .execute(&mut *self.tx)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(())
    }

    async fn update(&mut self, lock: &ActiveLock) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE active_locks
            SET path = ?, href = ?, recursive = ?, owner = ?, access_type = ?,
                share_mode = ?, timeout_ms = ?, issued = ?, last_refresh = ?, expiration = ?
            WHERE state_token = ?
            "#,
        )
        .bind(&lock.path)
        .bind(&lock.href)
        .bind(lock.recursive)
        .bind(&lock.owner)
        .bind(lock.access_type.as_str())
        .bind(lock.share_mode.as_str())
        .bind(lock.timeout.to_millis())
        .bind(lock.issued)
        .bind(lock.last_refresh)
        .bind(lock.expiration)
        .bind(&lock.state_token)
        .execute(&mut *self.tx)
        .await
        .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(Error::Other(format!("lock {} does not exist", lock.state_token)));
        }
        Ok(())
    }

    async fn remove(&mut self, state_token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM active_locks WHERE state_token = ?")
            .bind(state_token)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&mut self, state_token: &str) -> Result<Option<ActiveLock>> {
        let row: Option<ActiveLockRow> =
            sqlx::query_as(&format!("{} WHERE state_token = ?", SELECT_COLUMNS))
                .bind(state_token)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(Error::DatabaseError)?;

        row.map(ActiveLockRow::into_active_lock).transpose()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.commit().await.map_err(Error::DatabaseError)
    }
}

/// Database row for an active lock
#[derive(Debug, sqlx::FromRow)]
struct ActiveLockRow {
    state_token: String,
    path: String,
    href: String,
    recursive: bool,
    owner: Option<String>,
    access_type: String,
    share_mode: String,
    timeout_ms: Option<i64>,
    issued: DateTime<Utc>,
    last_refresh: Option<DateTime<Utc>>,
    expiration: DateTime<Utc>,
}

impl ActiveLockRow {
    fn into_active_lock(self) -> Result<ActiveLock> {
        let corrupted = |e: Error| Error::Corrupted(format!("lock {}: {}", self.state_token, e));

        Ok(ActiveLock {
            access_type: self.access_type.parse().map_err(corrupted)?,
            share_mode: self.share_mode.parse().map_err(corrupted)?,
            timeout: LockTimeout::from_millis(self.timeout_ms)?,
            state_token: self.state_token,
            path: self.path,
            href: self.href,
            recursive: self.recursive,
            owner: self.owner,
            issued: self.issued,
            last_refresh: self.last_refresh,
            expiration: self.expiration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::{Lock, ShareMode};

    async fn store() -> (Database, SqliteLockStore) {
        let db = Database::in_memory().await.expect("Failed to create database");
        let store = SqliteLockStore::from_database(&db);
        (db, store)
    }

    fn sample(path: &str) -> ActiveLock {
        ActiveLock::grant(
            Lock::exclusive(path)
                .recursive(true)
                .with_owner("bob")
                .with_timeout(LockTimeout::seconds(90)),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_add_get_roundtrip() {
        let (_db, store) = store().await;
        let lock = sample("/docs");

        let mut txn = store.begin().await.unwrap();
        txn.add(&lock).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        let loaded = txn.get(&lock.state_token).await.unwrap().unwrap();
        assert_eq!(loaded.path, "/docs");
        assert_eq!(loaded.owner.as_deref(), Some("bob"));
        assert_eq!(loaded.share_mode, ShareMode::Exclusive);
        assert!(loaded.recursive);
        assert_eq!(loaded.timeout, LockTimeout::seconds(90));
        assert!((loaded.expiration - lock.expiration).num_milliseconds().abs() < 1);
        assert!(txn.get("urn:uuid:missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let (_db, store) = store().await;

        {
            let mut txn = store.begin().await.unwrap();
            txn.add(&sample("/a")).await.unwrap();
        }

        let mut txn = store.begin().await.unwrap();
        assert!(txn.list_active_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let (_db, store) = store().await;
        let lock = sample("/a");

        let mut txn = store.begin().await.unwrap();
        txn.add(&lock).await.unwrap();
        let refreshed = lock.refreshed(LockTimeout::Infinite, Utc::now());
        txn.update(&refreshed).await.unwrap();
        assert!(txn.update(&sample("/b")).await.is_err());
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        let loaded = txn.get(&lock.state_token).await.unwrap().unwrap();
        assert!(loaded.timeout.is_infinite());
        assert!(loaded.last_refresh.is_some());

        assert!(txn.remove(&lock.state_token).await.unwrap());
        assert!(!txn.remove(&lock.state_token).await.unwrap());
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_token_rejected() {
        let (_db, store) = store().await;
        let lock = sample("/a");

        let mut txn = store.begin().await.unwrap();
        txn.add(&lock).await.unwrap();
        let err = txn.add(&lock).await.unwrap_err();
        assert!(matches!(err, Error::DatabaseError(_)));
    }

    #[tokio::test]
    async fn test_corrupted_row_reported() {
        let (db, store) = store().await;
        let lock = sample("/a");

        let mut txn = store.begin().await.unwrap();
        txn.add(&lock).await.unwrap();
        txn.commit().await.unwrap();

        sqlx::query("UPDATE active_locks SET timeout_ms = -5")
            .execute(db.pool())
            .await
            .unwrap();

        let mut txn = store.begin().await.unwrap();
        let err = txn.list_active_locks().await.unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }
}
