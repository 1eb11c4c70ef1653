//! Davlock Core Library
//!
//! Lock management for a WebDAV server:
//! - Lock model and conflict rules (RFC 4918 write locks)
//! - Transactional lock manager over pluggable stores
//! - Single-timer expiration scheduler
//! - Storage backends (in-memory, JSON file, SQLite)
//! - Configuration

pub mod config;
pub mod domain;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::locking::{
        AcquireOutcome, ActiveLock, Lock, LockConfig, LockManager, LockStatus, LockStore,
        LockTimeout, RefreshOutcome, ReleaseStatus, ShareMode, WriteAccess,
    };
    pub use crate::error::{Error, Result};
    pub use crate::storage::{InMemoryLockStore, JsonFileLockStore, SqliteLockStore};
}
