//! WebDAV lock management
//!
//! Grants, refreshes, releases and queries write locks on hierarchical
//! resource paths, following the RFC 4918 locking model.
//!
//! # Architecture
//!
//! - **Types**: `Lock` requests, `ActiveLock` grants and the typed outcomes
//! - **Lock Manager**: `LockManager` runs every operation as one store transaction
//! - **Stores**: `LockStore` / `LockTransaction`, implemented in [`crate::storage`]
//! - **Scheduler**: `LockCleanupScheduler` releases locks when they expire,
//!   using a single timer for all of them
//!
//! Two locks overlap when they sit on the same path, or when one is an
//! ancestor of the other and the ancestor lock is recursive. Overlapping
//! locks conflict unless both are shared.
//!
//! # Example
//!
//! ```ignore
//! use davlock_core::domain::locking::{Lock, LockConfig, LockManager};
//!
//! let manager = LockManager::in_memory(LockConfig::default());
//!
//! let outcome = manager.acquire(Lock::exclusive("/docs").recursive(true)).await?;
//! if let Some(lock) = outcome.acquired() {
//!     // ... write below /docs ...
//!     manager.release(&lock.state_token).await?;
//! }
//! ```

pub mod event;
pub mod manager;
pub mod path;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod types;

// Re-export main types
pub use event::{LockEvent, LockEventType};
pub use manager::LockManager;
pub use scheduler::{ExpiredLockHandler, LockCleanupScheduler};
pub use status::LockStatus;
pub use store::{LockStore, LockTransaction};
pub use types::{
    AccessType, AcquireOutcome, ActiveLock, ExpirationRounding, Lock, LockConfig, LockTimeout,
    RefreshOutcome, ReleaseStatus, STATE_TOKEN_PREFIX, ShareMode, WriteAccess, max_expiration,
    new_state_token,
};
