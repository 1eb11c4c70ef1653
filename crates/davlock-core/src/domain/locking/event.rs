//! Locking lifecycle events
//!
//! Published by the lock manager on a broadcast channel so diagnostics and
//! tests can observe grants, refreshes, releases and expirations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::ActiveLock;

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// A lock was granted
    Acquired,
    /// A lock's expiration was extended
    Refreshed,
    /// A lock was released by a client
    Released,
    /// A lock was released by the cleanup scheduler
    Expired,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "lock_acquired",
            Self::Refreshed => "lock_refreshed",
            Self::Released => "lock_released",
            Self::Expired => "lock_expired",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A locking lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// Type of event
    pub event_type: LockEventType,
    /// State token of the lock concerned
    pub state_token: String,
    /// Path of the lock concerned
    pub path: String,
    /// Event data
    pub data: Option<serde_json::Value>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl LockEvent {
    /// Create a new lock event
    pub fn new(lock: &ActiveLock, event_type: LockEventType, data: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            state_token: lock.state_token.clone(),
            path: lock.path.clone(),
            data,
            created_at: Utc::now(),
        }
    }

    /// Create a lock acquired event
    pub fn acquired(lock: &ActiveLock) -> Self {
        let data = serde_json::json!({
            "share_mode": lock.share_mode.as_str(),
            "recursive": lock.recursive,
            "expiration": lock.expiration,
        });
        Self::new(lock, LockEventType::Acquired, Some(data))
    }

    /// Create a lock refreshed event
    pub fn refreshed(lock: &ActiveLock) -> Self {
        let data = serde_json::json!({
            "expiration": lock.expiration,
        });
        Self::new(lock, LockEventType::Refreshed, Some(data))
    }

    /// Create a lock released event
    pub fn released(lock: &ActiveLock) -> Self {
        let held_ms = (Utc::now() - lock.issued).num_milliseconds().max(0);
        let data = serde_json::json!({
            "held_ms": held_ms,
        });
        Self::new(lock, LockEventType::Released, Some(data))
    }

    /// Create a lock expired event
    pub fn expired(lock: &ActiveLock) -> Self {
        let data = serde_json::json!({
            "expiration": lock.expiration,
        });
        Self::new(lock, LockEventType::Expired, Some(data))
    }
}
