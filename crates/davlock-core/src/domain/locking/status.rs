//! Locks affecting a resource

use serde::{Deserialize, Serialize};

use super::path;
use super::types::ActiveLock;

/// Locks relevant to a path, split by where they sit relative to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    /// Locks exactly at the path
    pub reference_locks: Vec<ActiveLock>,

    /// Recursive locks on an ancestor that reach down to the path
    pub parent_locks: Vec<ActiveLock>,

    /// Locks below the path (only collected for recursive operations)
    pub child_locks: Vec<ActiveLock>,
}

impl LockStatus {
    /// Classify `locks` relative to the normalized `target`
    pub fn collect<'a>(
        target: &str,
        recursive: bool,
        locks: impl IntoIterator<Item = &'a ActiveLock>,
    ) -> Self {
        let mut status = Self::default();
        for lock in locks {
            if lock.path == target {
                status.reference_locks.push(lock.clone());
            } else if lock.recursive && path::is_strict_ancestor(&lock.path, target) {
                status.parent_locks.push(lock.clone());
            } else if recursive && path::is_strict_ancestor(target, &lock.path) {
                status.child_locks.push(lock.clone());
            }
        }
        status
    }

    pub fn is_empty(&self) -> bool {
        self.reference_locks.is_empty() && self.parent_locks.is_empty() && self.child_locks.is_empty()
    }

    /// Total number of locks
    pub fn len(&self) -> usize {
        self.reference_locks.len() + self.parent_locks.len() + self.child_locks.len()
    }

    /// All locks, reference first, then parents, then children
    pub fn iter(&self) -> impl Iterator<Item = &ActiveLock> {
        self.reference_locks
            .iter()
            .chain(self.parent_locks.iter())
            .chain(self.child_locks.iter())
    }
}
