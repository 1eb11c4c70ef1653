//! Storage layer - lock store backends
//!
//! # Architecture
//!
//! - `memory`: process-local map, lost on exit
//! - `json`: a single JSON document rewritten on every commit
//! - `sqlite`: the `active_locks` table in a SQLite database
//! - `database`: connection pool management and initialization
//! - `migrations`: schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use davlock_core::storage::{Database, SqliteLockStore};
//!
//! let db = Database::open("/var/lib/davlock/locks.db").await?;
//! let store = SqliteLockStore::from_database(&db);
//! ```

pub mod database;
pub mod json;
pub mod memory;
pub mod migrations;
pub mod sqlite;

pub use database::{Database, DatabaseConfig, default_database_path};
pub use json::JsonFileLockStore;
pub use memory::InMemoryLockStore;
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};
pub use sqlite::SqliteLockStore;
