//! Domain layer
//!
//! Contains the lock model and the lock manager.

pub mod locking;
