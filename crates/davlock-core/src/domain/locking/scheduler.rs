//! Lock cleanup scheduler
//!
//! Releases locks when they expire. However many locks are registered, a
//! single background task sleeps until the nearest expiration; registering a
//! lock that expires sooner, or removing the nearest one, wakes the task so
//! it re-arms its timer.
//!
//! The scheduler is never the source of truth for a lock's existence. It
//! only remembers `(state token, expiration)` and a weak reference to the
//! handler that must release the lock from its store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;

use super::types::{ActiveLock, ExpirationRounding, max_expiration};

/// Receives locks whose expiration has passed
#[async_trait]
pub trait ExpiredLockHandler: Send + Sync {
    /// Release `lock`; a lock that is already gone is not an error
    async fn on_expired(&self, lock: ActiveLock) -> Result<()>;
}

struct Entry {
    lock: ActiveLock,
    handler: Weak<dyn ExpiredLockHandler>,
}

/// Multimap from expiration to entries, plus a token index for removal
#[derive(Default)]
struct ScheduleState {
    by_expiration: BTreeMap<DateTime<Utc>, Vec<Entry>>,
    by_token: HashMap<String, DateTime<Utc>>,
}

impl ScheduleState {
    fn nearest(&self) -> Option<DateTime<Utc>> {
        self.by_expiration.keys().next().copied()
    }

    /// Insert or replace an entry; returns whether the nearest expiration changed
    fn insert(&mut self, entry: Entry) -> bool {
        let before = self.nearest();
        self.remove(&entry.lock.state_token);

        let expiration = entry.lock.expiration;
        self.by_token.insert(entry.lock.state_token.clone(), expiration);
        self.by_expiration.entry(expiration).or_default().push(entry);

        self.nearest() != before
    }

    /// Returns `Some(was_nearest)` when the token was scheduled
    fn remove(&mut self, state_token: &str) -> Option<bool> {
        let expiration = self.by_token.remove(state_token)?;
        let was_nearest = self.nearest() == Some(expiration);

        if let Some(bucket) = self.by_expiration.get_mut(&expiration) {
            bucket.retain(|e| e.lock.state_token != state_token);
            if bucket.is_empty() {
                self.by_expiration.remove(&expiration);
            }
        }
        Some(was_nearest)
    }

    /// Pop every entry due at or before `now`
    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Entry> {
        let mut due = Vec::new();
        while let Some(mut first) = self.by_expiration.first_entry() {
            if *first.key() > now {
                break;
            }
            due.append(first.get_mut());
            first.remove();
        }
        for entry in &due {
            self.by_token.remove(&entry.lock.state_token);
        }
        due
    }

    fn len(&self) -> usize {
        self.by_token.len()
    }
}

struct Shared {
    state: Mutex<ScheduleState>,
    wake: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-timer expiration scheduler
///
/// May be shared between several lock managers. The background task is
/// started on the first [`add`](Self::add) from within a Tokio runtime and
/// stops when the scheduler is dropped. If the runtime running the task
/// shuts down, the next `add` starts a new task on the caller's runtime.
pub struct LockCleanupScheduler {
    shared: Arc<Shared>,
    rounding: ExpirationRounding,
    timer: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for LockCleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCleanupScheduler")
            .field("rounding", &self.rounding)
            .field("scheduled", &self.len())
            .field("next_expiration", &self.next_expiration())
            .finish()
    }
}

impl LockCleanupScheduler {
    /// Create a scheduler with the given timer rounding
    pub fn new(rounding: ExpirationRounding) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ScheduleState::default()),
                wake: Notify::new(),
            }),
            rounding,
            timer: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn rounding(&self) -> ExpirationRounding {
        self.rounding
    }

    /// Schedule `lock` for release through `handler`
    ///
    /// Replaces any existing entry for the same state token. Locks with an
    /// infinite timeout are not scheduled; returns whether the lock was.
    pub fn add(&self, handler: Weak<dyn ExpiredLockHandler>, lock: &ActiveLock) -> bool {
        if lock.timeout.is_infinite() || lock.expiration >= max_expiration() {
            self.remove(&lock.state_token);
            return false;
        }

        self.ensure_running();

        let rearm = self.shared.state().insert(Entry {
            lock: lock.clone(),
            handler,
        });
        trace!(state_token = %lock.state_token, expiration = %lock.expiration, rearm, "Lock scheduled");
        if rearm {
            self.shared.wake.notify_one();
        }
        true
    }

    /// Stop tracking a lock; returns whether it was scheduled
    pub fn remove(&self, state_token: &str) -> bool {
        let removed = self.shared.state().remove(state_token);
        if removed == Some(true) {
            self.shared.wake.notify_one();
        }
        removed.is_some()
    }

    /// Whether a lock is currently scheduled
    pub fn contains(&self, state_token: &str) -> bool {
        self.shared.state().by_token.contains_key(state_token)
    }

    /// Number of scheduled locks
    pub fn len(&self) -> usize {
        self.shared.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The nearest scheduled expiration
    pub fn next_expiration(&self) -> Option<DateTime<Utc>> {
        self.shared.state().nearest()
    }

    /// Whether a timer task is currently alive
    pub fn is_running(&self) -> bool {
        self.timer()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) {
        let mut timer = self.timer();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let restarting = timer.is_some();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                *timer = Some(handle.spawn(run_timer(
                    Arc::clone(&self.shared),
                    self.rounding,
                    self.shutdown.clone(),
                )));
                debug!(rounding = %self.rounding, restarting, "Lock cleanup timer started");
            }
            Err(_) => {
                warn!("No Tokio runtime available, lock cleanup timer not started");
            }
        }
    }
}

impl Drop for LockCleanupScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.timer().take() {
            handle.abort();
        }
    }
}

async fn run_timer(shared: Arc<Shared>, rounding: ExpirationRounding, shutdown: CancellationToken) {
    loop {
        let delay = shared
            .state()
            .nearest()
            .map(|expiration| rounding.round_up(until(expiration)));

        match delay {
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = shared.wake.notified() => continue,
                }
            }
            Some(delay) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = shared.wake.notified() => continue,
                    _ = tokio::time::sleep(delay) => fire(&shared).await,
                }
            }
        }
    }
    debug!("Lock cleanup timer stopped");
}

/// Pop everything that is due, then release it outside the state mutex
async fn fire(shared: &Shared) {
    let due = shared.state().pop_due(Utc::now());

    for entry in due {
        let token = entry.lock.state_token.clone();
        let Some(handler) = entry.handler.upgrade() else {
            debug!(state_token = %token, "Lock owner dropped, skipping expiration");
            continue;
        };
        debug!(state_token = %token, path = %entry.lock.path, "Lock expired");
        if let Err(e) = handler.on_expired(entry.lock).await {
            warn!(state_token = %token, error = %e, "Failed to release expired lock");
        }
    }
}

fn until(expiration: DateTime<Utc>) -> Duration {
    (expiration - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
