//! Lock manager behavior, checked against every storage backend

use chrono::Utc;
use davlock_core::domain::locking::{
    ExpirationRounding, Lock, LockConfig, LockEventType, LockManager, LockStore, LockTimeout,
    RefreshOutcome, ReleaseStatus,
};
use davlock_core::storage::{Database, InMemoryLockStore, JsonFileLockStore, SqliteLockStore};
use std::time::Duration;
use tempfile::TempDir;

fn config() -> LockConfig {
    LockConfig::default().with_rounding(ExpirationRounding::HundredMilliseconds)
}

async fn open_memory() -> (LockManager<InMemoryLockStore>, Option<TempDir>) {
    (LockManager::in_memory(config()), None)
}

async fn open_json() -> (LockManager<JsonFileLockStore>, Option<TempDir>) {
    let dir = TempDir::new().unwrap();
    let store = JsonFileLockStore::open(dir.path().join("locks.json"))
        .await
        .unwrap();
    (LockManager::new(store, config()), Some(dir))
}

async fn open_sqlite() -> (LockManager<SqliteLockStore>, Option<TempDir>) {
    let db = Database::in_memory().await.unwrap();
    let store = SqliteLockStore::from_database(&db);
    (LockManager::new(store, config()), None)
}

mod properties {
    use super::*;

    pub async fn idempotent_release<S: LockStore>(manager: &LockManager<S>) {
        let lock = manager
            .acquire(Lock::exclusive("/a"))
            .await
            .unwrap()
            .acquired()
            .unwrap();

        assert_eq!(manager.release(&lock.state_token).await.unwrap(), ReleaseStatus::Released);
        assert_eq!(manager.release(&lock.state_token).await.unwrap(), ReleaseStatus::NoLock);
        assert!(manager.query_locks("/a", false).await.unwrap().is_empty());
    }

    pub async fn shared_shared_compatible<S: LockStore>(manager: &LockManager<S>) {
        for recursive in [false, true, false, true] {
            let outcome = manager
                .acquire(Lock::shared("/shared").recursive(recursive))
                .await
                .unwrap();
            assert!(outcome.is_acquired(), "recursive={}", recursive);
        }
        assert_eq!(manager.query_locks("/shared", false).await.unwrap().len(), 4);
    }

    pub async fn exclusive_recursive_blocks_subtree<S: LockStore>(manager: &LockManager<S>) {
        let root = manager
            .acquire(Lock::exclusive("/p").recursive(true))
            .await
            .unwrap()
            .acquired()
            .unwrap();

        for request in [
            Lock::exclusive("/p"),
            Lock::shared("/p"),
            Lock::exclusive("/p/q"),
            Lock::shared("/p/q/r").recursive(true),
        ] {
            let outcome = manager.acquire(request).await.unwrap();
            assert_eq!(outcome.conflicts(), std::slice::from_ref(&root));
        }

        assert!(manager.acquire(Lock::exclusive("/pq")).await.unwrap().is_acquired());
    }

    pub async fn non_recursive_ancestor_allows_descendants<S: LockStore>(
        manager: &LockManager<S>,
    ) {
        manager.acquire(Lock::exclusive("/")).await.unwrap().acquired().unwrap();

        assert!(manager.acquire(Lock::shared("/child")).await.unwrap().is_acquired());
        assert!(manager.acquire(Lock::exclusive("/child2")).await.unwrap().is_acquired());
    }

    pub async fn shared_recursive_ancestor<S: LockStore>(manager: &LockManager<S>) {
        let root = manager
            .acquire(Lock::shared("/").recursive(true))
            .await
            .unwrap()
            .acquired()
            .unwrap();

        assert!(manager.acquire(Lock::shared("/child")).await.unwrap().is_acquired());

        let outcome = manager.acquire(Lock::exclusive("/other")).await.unwrap();
        assert_eq!(outcome.conflicts(), std::slice::from_ref(&root));
    }

    pub async fn expiration_without_client_action<S: LockStore>(manager: &LockManager<S>) {
        let mut events = manager.subscribe();
        let lock = manager
            .acquire(Lock::exclusive("/a").with_timeout(LockTimeout::Finite(Duration::from_millis(200))))
            .await
            .unwrap()
            .acquired()
            .unwrap();

        let expired = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.event_type == LockEventType::Expired {
                    return event;
                }
            }
        })
        .await
        .expect("lock should expire");

        assert_eq!(expired.state_token, lock.state_token);
        assert!(manager.query_locks("/a", false).await.unwrap().is_empty());
        assert_eq!(
            manager.refresh(&lock.state_token, LockTimeout::seconds(60)).await.unwrap(),
            RefreshOutcome::NotFound
        );
        assert!(!manager.scheduler().contains(&lock.state_token));
    }

    pub async fn refresh_resets_expiration<S: LockStore>(manager: &LockManager<S>) {
        let lock = manager
            .acquire(Lock::exclusive("/r").with_timeout(LockTimeout::seconds(60)))
            .await
            .unwrap()
            .acquired()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let before = Utc::now();
        let refreshed = manager
            .refresh(&lock.state_token, LockTimeout::seconds(120))
            .await
            .unwrap()
            .refreshed()
            .unwrap();
        let after = Utc::now();

        let lower = before + chrono::Duration::seconds(120);
        let upper = after + chrono::Duration::seconds(120);
        assert!(refreshed.expiration >= lower && refreshed.expiration <= upper);
        assert_eq!(refreshed.issued, lock.issued);
        assert_eq!(refreshed.timeout, LockTimeout::seconds(120));

        let stored = manager.get_lock(&lock.state_token).await.unwrap().unwrap();
        assert_eq!(stored.timeout, LockTimeout::seconds(120));
        assert!(stored.expiration > lock.expiration);
    }

    pub async fn end_to_end_scenario<S: LockStore>(manager: &LockManager<S>) {
        let docs = manager
            .acquire(
                Lock::exclusive("/docs")
                    .recursive(true)
                    .with_timeout(LockTimeout::seconds(60)),
            )
            .await
            .unwrap()
            .acquired()
            .unwrap();

        let outcome = manager.acquire(Lock::shared("/docs/readme.txt")).await.unwrap();
        assert!(outcome.conflicts().contains(&docs));

        manager.release(&docs.state_token).await.unwrap();

        let first = manager.acquire(Lock::shared("/docs")).await.unwrap().acquired().unwrap();
        let second = manager.acquire(Lock::shared("/docs")).await.unwrap().acquired().unwrap();
        assert_ne!(first.state_token, second.state_token);

        let timeout = Duration::from_millis(200);
        manager
            .acquire(Lock::exclusive("/a").with_timeout(LockTimeout::Finite(timeout)))
            .await
            .unwrap()
            .acquired()
            .unwrap();
        tokio::time::sleep(timeout * 3 / 2).await;
        // the cleanup timer may still be pending, but expired locks are never reported
        assert!(manager.query_locks("/a", false).await.unwrap().is_empty());
    }
}

macro_rules! backend_tests {
    ($backend:ident, $open:path) => {
        mod $backend {
            use super::*;

            #[tokio::test]
            async fn test_idempotent_release() {
                let (manager, _guard) = $open().await;
                properties::idempotent_release(&manager).await;
            }

            #[tokio::test]
            async fn test_shared_shared_compatible() {
                let (manager, _guard) = $open().await;
                properties::shared_shared_compatible(&manager).await;
            }

            #[tokio::test]
            async fn test_exclusive_recursive_blocks_subtree() {
                let (manager, _guard) = $open().await;
                properties::exclusive_recursive_blocks_subtree(&manager).await;
            }

            #[tokio::test]
            async fn test_non_recursive_ancestor_allows_descendants() {
                let (manager, _guard) = $open().await;
                properties::non_recursive_ancestor_allows_descendants(&manager).await;
            }

            #[tokio::test]
            async fn test_shared_recursive_ancestor() {
                let (manager, _guard) = $open().await;
                properties::shared_recursive_ancestor(&manager).await;
            }

            #[tokio::test]
            async fn test_expiration_without_client_action() {
                let (manager, _guard) = $open().await;
                properties::expiration_without_client_action(&manager).await;
            }

            #[tokio::test]
            async fn test_refresh_resets_expiration() {
                let (manager, _guard) = $open().await;
                properties::refresh_resets_expiration(&manager).await;
            }

            #[tokio::test]
            async fn test_end_to_end_scenario() {
                let (manager, _guard) = $open().await;
                properties::end_to_end_scenario(&manager).await;
            }
        }
    };
}

backend_tests!(memory, open_memory);
backend_tests!(json, open_json);
backend_tests!(sqlite, open_sqlite);
