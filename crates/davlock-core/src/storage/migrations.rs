//! Database migrations
//!
//! Schema versions for the SQLite lock table, applied automatically when a
//! [`Database`](super::Database) is opened.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 1;

const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Active locks table
///
/// `timeout_ms` is NULL for infinite locks.
const MIGRATION_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS active_locks (
        state_token TEXT PRIMARY KEY NOT NULL,
        path TEXT NOT NULL,
        href TEXT NOT NULL,
        recursive INTEGER NOT NULL DEFAULT 0,
        owner TEXT,
        access_type TEXT NOT NULL DEFAULT 'write' CHECK (access_type IN ('write')),
        share_mode TEXT NOT NULL CHECK (share_mode IN ('shared', 'exclusive')),
        timeout_ms INTEGER,
        issued TIMESTAMP NOT NULL,
        last_refresh TIMESTAMP,
        expiration TIMESTAMP NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_active_locks_path ON active_locks(path);
    CREATE INDEX IF NOT EXISTS idx_active_locks_expiration ON active_locks(expiration);
"#;

async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::debug!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Active locks table");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Schema version found in the database
    pub current_version: i32,
    /// Latest schema version
    pub target_version: i32,
    pub needs_migration: bool,
}
