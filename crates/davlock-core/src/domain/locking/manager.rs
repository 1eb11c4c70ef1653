//! Lock manager
//!
//! The lock manager is the single entry point for granting, refreshing,
//! releasing and querying WebDAV locks. It handles:
//! - Conflict detection over the path hierarchy (shared/exclusive, depth)
//! - One store transaction per operation
//! - Registration of every granted lock with the cleanup scheduler
//! - Recovery of persisted locks on first use
//! - Lifecycle events for diagnostics

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{OnceCell, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::LockEvent;
use super::path;
use super::scheduler::{ExpiredLockHandler, LockCleanupScheduler};
use super::status::LockStatus;
use super::store::{LockStore, LockTransaction};
use super::types::{
    AcquireOutcome, ActiveLock, Lock, LockConfig, LockTimeout, RefreshOutcome, ReleaseStatus,
    ShareMode, WriteAccess,
};
use crate::error::{Error, Result};
use crate::storage::InMemoryLockStore;

/// Lock manager, generic over its persistence backend
///
/// Cheap to clone; clones share the store, the scheduler and the event
/// channel.
pub struct LockManager<S: LockStore> {
    inner: Arc<ManagerInner<S>>,
}

impl<S: LockStore> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: LockStore> std::fmt::Debug for LockManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.inner.config)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

struct ManagerInner<S: LockStore> {
    store: S,
    config: LockConfig,
    scheduler: Arc<LockCleanupScheduler>,
    events: broadcast::Sender<LockEvent>,
    initialized: OnceCell<()>,
    self_ref: Weak<ManagerInner<S>>,
}

impl LockManager<InMemoryLockStore> {
    /// Create a lock manager over a fresh in-memory store
    pub fn in_memory(config: LockConfig) -> Self {
        Self::new(InMemoryLockStore::new(), config)
    }
}

impl<S: LockStore> LockManager<S> {
    /// Create a new lock manager with its own cleanup scheduler
    pub fn new(store: S, config: LockConfig) -> Self {
        let scheduler = Arc::new(LockCleanupScheduler::new(config.rounding));
        Self::with_scheduler(store, config, scheduler)
    }

    /// Create a lock manager that registers its locks with a shared scheduler
    ///
    /// The scheduler's own rounding applies to its timer.
    pub fn with_scheduler(store: S, config: LockConfig, scheduler: Arc<LockCleanupScheduler>) -> Self {
        if scheduler.rounding() != config.rounding {
            debug!(
                configured = %config.rounding,
                scheduler = %scheduler.rounding(),
                "Shared scheduler uses a different timer rounding"
            );
        }
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new_cyclic(|self_ref| ManagerInner {
            store,
            config,
            scheduler,
            events,
            initialized: OnceCell::new(),
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    /// Get the configuration
    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Get the underlying store
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Get the cleanup scheduler
    pub fn scheduler(&self) -> &Arc<LockCleanupScheduler> {
        &self.inner.scheduler
    }

    /// Subscribe to lock lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.inner.events.subscribe()
    }

    /// Load persisted locks and schedule their expiration
    ///
    /// Called implicitly by every operation; calling it explicitly surfaces
    /// recovery failures early. Runs at most once.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.ensure_initialized().await
    }

    /// Try to grant `lock`
    ///
    /// Returns every conflicting lock when the request cannot be granted.
    pub async fn acquire(&self, lock: Lock) -> Result<AcquireOutcome> {
        self.acquire_with_cancel(lock, &CancellationToken::new()).await
    }

    /// [`acquire`](Self::acquire) with a cancellation signal
    pub async fn acquire_with_cancel(&self, lock: Lock, cancel: &CancellationToken) -> Result<AcquireOutcome> {
        self.inner.acquire(lock, cancel).await
    }

    /// Extend a lock's lifetime, starting now
    pub async fn refresh(&self, state_token: &str, timeout: LockTimeout) -> Result<RefreshOutcome> {
        self.refresh_with_cancel(state_token, timeout, &CancellationToken::new())
            .await
    }

    /// [`refresh`](Self::refresh) with a cancellation signal
    pub async fn refresh_with_cancel(
        &self,
        state_token: &str,
        timeout: LockTimeout,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome> {
        self.inner.refresh(state_token, timeout, cancel).await
    }

    /// Release a lock; releasing an unknown token is a no-op
    pub async fn release(&self, state_token: &str) -> Result<ReleaseStatus> {
        self.release_with_cancel(state_token, &CancellationToken::new())
            .await
    }

    /// [`release`](Self::release) with a cancellation signal
    pub async fn release_with_cancel(&self, state_token: &str, cancel: &CancellationToken) -> Result<ReleaseStatus> {
        self.inner.ensure_initialized().await?;
        self.inner.release(state_token, None, cancel).await
    }

    /// Release a lock as addressed through `path`
    ///
    /// Returns [`ReleaseStatus::InvalidLockRange`] when the lock does not
    /// cover `path`.
    pub async fn release_at(&self, path: &str, state_token: &str) -> Result<ReleaseStatus> {
        let path = path::normalize(path)?;
        self.inner.ensure_initialized().await?;
        self.inner
            .release(state_token, Some(&path), &CancellationToken::new())
            .await
    }

    /// Locks affecting `path`
    ///
    /// Child locks are only collected when `recursive` is set.
    pub async fn query_locks(&self, path: &str, recursive: bool) -> Result<LockStatus> {
        self.query_locks_with_cancel(path, recursive, &CancellationToken::new())
            .await
    }

    /// [`query_locks`](Self::query_locks) with a cancellation signal
    pub async fn query_locks_with_cancel(
        &self,
        path: &str,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> Result<LockStatus> {
        let path = path::normalize(path)?;
        let locks = self.inner.live_locks(cancel).await?;
        Ok(LockStatus::collect(&path, recursive, &locks))
    }

    /// All unexpired locks
    pub async fn list_locks(&self) -> Result<Vec<ActiveLock>> {
        self.inner.live_locks(&CancellationToken::new()).await
    }

    /// An unexpired lock by state token
    pub async fn get_lock(&self, state_token: &str) -> Result<Option<ActiveLock>> {
        self.inner.ensure_initialized().await?;
        let mut txn = self.inner.store.begin().await?;
        let lock = txn.get(state_token).await?;
        Ok(lock.filter(|l| !l.is_expired()))
    }

    /// Decide whether a mutation of `path` may proceed given the submitted tokens
    ///
    /// Every exclusive lock affecting the path must have its token
    /// submitted. Shared locks are satisfied per resource: one submitted
    /// token among the shared locks covering a resource is enough.
    pub async fn check_write_access(
        &self,
        path: &str,
        recursive: bool,
        submitted_tokens: &[&str],
    ) -> Result<WriteAccess> {
        let status = self.query_locks(path, recursive).await?;
        let submitted = |lock: &ActiveLock| submitted_tokens.contains(&lock.state_token.as_str());

        let mut denied: Vec<ActiveLock> = status
            .iter()
            .filter(|l| l.share_mode == ShareMode::Exclusive && !submitted(l))
            .cloned()
            .collect();

        let covering_shared: Vec<&ActiveLock> = status
            .reference_locks
            .iter()
            .chain(status.parent_locks.iter())
            .filter(|l| l.share_mode == ShareMode::Shared)
            .collect();
        if !covering_shared.is_empty() && !covering_shared.iter().any(|l| submitted(l)) {
            denied.extend(covering_shared.into_iter().cloned());
        }

        let mut shared_children: BTreeMap<&str, Vec<&ActiveLock>> = BTreeMap::new();
        for lock in status.child_locks.iter().filter(|l| l.share_mode == ShareMode::Shared) {
            shared_children.entry(lock.path.as_str()).or_default().push(lock);
        }
        for group in shared_children.into_values() {
            if !group.iter().any(|l| submitted(l)) {
                denied.extend(group.into_iter().cloned());
            }
        }

        if denied.is_empty() {
            Ok(WriteAccess::Granted)
        } else {
            Ok(WriteAccess::Denied(denied))
        }
    }

    /// Release every lock at or below `path`
    ///
    /// Used once the resources themselves are gone (DELETE, MOVE source).
    pub async fn release_all_under(&self, path: &str) -> Result<usize> {
        let root = path::normalize(path)?;
        self.inner.ensure_initialized().await?;
        self.inner
            .remove_where(|lock, _| path::is_same_or_descendant(&root, &lock.path), LockEvent::released)
            .await
    }

    /// Remove every expired record immediately
    pub async fn purge_expired(&self) -> Result<usize> {
        self.inner.ensure_initialized().await?;
        self.inner
            .remove_where(|lock, now| lock.is_expired_at(now), LockEvent::expired)
            .await
    }
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Commit unless cancelled; past this point the change is permanent
async fn commit(txn: Box<dyn LockTransaction>, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    txn.commit().await
}

impl<S: LockStore> ManagerInner<S> {
    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| self.recover())
            .await
            .map(|_| ())
    }

    /// Schedule every persisted lock at its stored expiration
    async fn recover(&self) -> Result<()> {
        let locks = {
            let mut txn = self.store.begin().await?;
            txn.list_active_locks().await?
        };

        let now = Utc::now();
        let expired = locks.iter().filter(|l| l.is_expired_at(now)).count();
        for lock in &locks {
            self.schedule(lock);
        }

        if !locks.is_empty() {
            info!(recovered = locks.len(), expired, "Recovered persisted locks");
        }
        Ok(())
    }

    fn schedule(&self, lock: &ActiveLock) {
        let handler: Weak<dyn ExpiredLockHandler> = self.self_ref.clone();
        self.scheduler.add(handler, lock);
    }

    fn publish(&self, event: LockEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn validate_timeout(&self, timeout: LockTimeout) -> Result<LockTimeout> {
        if let Some(d) = timeout.as_duration() {
            if d.is_zero() {
                return Err(Error::InvalidInput("lock timeout must be positive".to_string()));
            }
            // stores keep timeouts in whole milliseconds
            if d.subsec_nanos() % 1_000_000 != 0 {
                return Err(Error::InvalidInput(format!(
                    "lock timeout {:?} is not a whole number of milliseconds",
                    d
                )));
            }
        }
        Ok(timeout.clamp_to(self.config.max_timeout))
    }

    async fn acquire(&self, lock: Lock, cancel: &CancellationToken) -> Result<AcquireOutcome> {
        let mut lock = lock.normalized()?;
        lock.timeout = self.validate_timeout(lock.timeout)?;
        self.ensure_initialized().await?;

        let mut txn = cancellable(cancel, self.store.begin()).await?;
        let now = Utc::now();
        let existing = cancellable(cancel, txn.list_active_locks()).await?;

        let conflicts: Vec<ActiveLock> = existing
            .into_iter()
            .filter(|e| !e.is_expired_at(now) && lock.conflicts_with(e))
            .collect();
        if !conflicts.is_empty() {
            debug!(
                path = %lock.path,
                share_mode = %lock.share_mode,
                recursive = lock.recursive,
                conflicts = conflicts.len(),
                "Lock request conflicts with existing locks"
            );
            return Ok(AcquireOutcome::Conflict(conflicts));
        }

        let active = ActiveLock::grant(lock, now);
        cancellable(cancel, txn.add(&active)).await?;
        commit(txn, cancel).await?;

        self.schedule(&active);
        info!(
            state_token = %active.state_token,
            path = %active.path,
            share_mode = %active.share_mode,
            recursive = active.recursive,
            timeout = %active.timeout,
            "Lock acquired"
        );
        self.publish(LockEvent::acquired(&active));
        Ok(AcquireOutcome::Acquired(active))
    }

    async fn refresh(
        &self,
        state_token: &str,
        timeout: LockTimeout,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome> {
        let timeout = self.validate_timeout(timeout)?;
        self.ensure_initialized().await?;

        let mut txn = cancellable(cancel, self.store.begin()).await?;
        let now = Utc::now();
        let Some(current) = cancellable(cancel, txn.get(state_token)).await? else {
            debug!(state_token = %state_token, "Refresh of unknown lock");
            return Ok(RefreshOutcome::NotFound);
        };
        if current.is_expired_at(now) {
            debug!(state_token = %state_token, "Refresh of expired lock");
            return Ok(RefreshOutcome::NotFound);
        }

        let refreshed = current.refreshed(timeout, now);
        cancellable(cancel, txn.update(&refreshed)).await?;
        commit(txn, cancel).await?;

        self.schedule(&refreshed);
        debug!(
            state_token = %refreshed.state_token,
            expiration = %refreshed.expiration,
            "Lock refreshed"
        );
        self.publish(LockEvent::refreshed(&refreshed));
        Ok(RefreshOutcome::Refreshed(refreshed))
    }

    async fn release(
        &self,
        state_token: &str,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ReleaseStatus> {
        let mut txn = cancellable(cancel, self.store.begin()).await?;
        let Some(lock) = cancellable(cancel, txn.get(state_token)).await? else {
            self.scheduler.remove(state_token);
            debug!(state_token = %state_token, "Release of unknown lock");
            return Ok(ReleaseStatus::NoLock);
        };

        if let Some(target) = target {
            if !lock.covers(target) {
                debug!(state_token = %state_token, path = %target, lock_path = %lock.path, "Lock does not cover path");
                return Ok(ReleaseStatus::InvalidLockRange);
            }
        }

        cancellable(cancel, txn.remove(state_token)).await?;
        commit(txn, cancel).await?;

        self.scheduler.remove(state_token);
        info!(state_token = %state_token, path = %lock.path, "Lock released");
        self.publish(LockEvent::released(&lock));
        Ok(ReleaseStatus::Released)
    }

    /// Scheduler-driven release
    ///
    /// The stored record decides: a lock refreshed after the scheduler
    /// popped it is rescheduled instead of released.
    async fn expire(&self, lock: ActiveLock) -> Result<()> {
        let mut txn = self.store.begin().await?;
        let Some(stored) = txn.get(&lock.state_token).await? else {
            return Ok(());
        };

        if !stored.is_expired_at(Utc::now()) {
            drop(txn);
            debug!(state_token = %stored.state_token, "Lock was refreshed before expiring");
            self.schedule(&stored);
            return Ok(());
        }

        txn.remove(&stored.state_token).await?;
        txn.commit().await?;

        info!(state_token = %stored.state_token, path = %stored.path, "Lock expired");
        self.publish(LockEvent::expired(&stored));
        Ok(())
    }

    async fn live_locks(&self, cancel: &CancellationToken) -> Result<Vec<ActiveLock>> {
        self.ensure_initialized().await?;
        let mut txn = cancellable(cancel, self.store.begin()).await?;
        let now = Utc::now();
        let locks = cancellable(cancel, txn.list_active_locks()).await?;
        Ok(locks.into_iter().filter(|l| !l.is_expired_at(now)).collect())
    }

    async fn remove_where(
        &self,
        predicate: impl Fn(&ActiveLock, chrono::DateTime<Utc>) -> bool,
        event: fn(&ActiveLock) -> LockEvent,
    ) -> Result<usize> {
        let mut txn = self.store.begin().await?;
        let now = Utc::now();
        let doomed: Vec<ActiveLock> = txn
            .list_active_locks()
            .await?
            .into_iter()
            .filter(|l| predicate(l, now))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        for lock in &doomed {
            txn.remove(&lock.state_token).await?;
        }
        txn.commit().await?;

        for lock in &doomed {
            self.scheduler.remove(&lock.state_token);
            self.publish(event(lock));
        }
        info!(removed = doomed.len(), "Locks removed");
        Ok(doomed.len())
    }
}

#[async_trait]
impl<S: LockStore> ExpiredLockHandler for ManagerInner<S> {
    async fn on_expired(&self, lock: ActiveLock) -> Result<()> {
        let token = lock.state_token.clone();
        self.expire(lock).await.inspect_err(|e| {
            warn!(
                state_token = %token,
                error = %e,
                code = e.code(),
                backend = e.is_backend_failure(),
                "Expiration release failed"
            );
        })
    }
}
