//! Davlock CLI - inspect and manage WebDAV locks

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use davlock_core::config::{Config, StorageBackend, StorageConfig};
use davlock_core::domain::locking::{
    AcquireOutcome, ActiveLock, Lock, LockConfig, LockManager, LockStatus, LockStore, LockTimeout,
    RefreshOutcome, ReleaseStatus, ShareMode, WriteAccess,
};
use davlock_core::storage::{Database, JsonFileLockStore, SqliteLockStore};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "davlock")]
#[command(author, version, about = "WebDAV lock manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Storage backend (overrides storage.backend)
    #[arg(long, global = true)]
    backend: Option<StorageBackend>,

    /// Database or lock file path (overrides storage.path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Lock(LockCommand),

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum LockCommand {
    /// Acquire a write lock
    Acquire {
        /// Resource path
        path: String,
        /// Take a shared lock instead of an exclusive one
        #[arg(long)]
        shared: bool,
        /// Lock the whole subtree (depth infinity)
        #[arg(short, long)]
        recursive: bool,
        /// Timeout in seconds, or "infinite"
        #[arg(short, long)]
        timeout: Option<LockTimeout>,
        /// Opaque owner description
        #[arg(long)]
        owner: Option<String>,
        /// Resource URL as seen by the client
        #[arg(long)]
        href: Option<String>,
    },

    /// Extend a lock's expiration
    Refresh {
        /// Lock state token
        token: String,
        /// New timeout in seconds, or "infinite"
        #[arg(short, long)]
        timeout: Option<LockTimeout>,
    },

    /// Release a lock
    Release {
        /// Lock state token
        token: String,
        /// Only release if the lock covers this path
        #[arg(long)]
        path: Option<String>,
    },

    /// Release every lock rooted at or below a path
    ReleaseUnder {
        /// Resource path
        path: String,
    },

    /// Show the locks affecting a path
    Query {
        /// Resource path
        path: String,
        /// Include locks on descendants
        #[arg(short, long)]
        recursive: bool,
    },

    /// List all live locks
    List,

    /// Show one lock
    Show {
        /// Lock state token
        token: String,
    },

    /// Check whether a write may proceed
    Check {
        /// Resource path
        path: String,
        /// The write affects the whole subtree
        #[arg(short, long)]
        recursive: bool,
        /// State tokens presented by the client
        #[arg(long = "token")]
        tokens: Vec<String>,
    },

    /// Release locks whose expiration has passed
    Purge,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "davlock=debug" } else { "davlock=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    let result = run(cli).await;
    if let Err(e) = &result {
        if let Some(error) = e.downcast_ref::<davlock_core::Error>() {
            if let Some(suggestion) = error.suggestion() {
                eprintln!("Hint ({}): {}", error.code(), suggestion);
            }
        }
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Config { action } => cmd_config(action, cli.quiet),
        Commands::Doctor => {
            let config = Config::load()?;
            let storage = storage_config(&config, cli.backend, cli.db);
            cmd_doctor(&storage, cli.quiet).await
        }
        Commands::Lock(command) => {
            let config = Config::load()?;
            let storage = storage_config(&config, cli.backend, cli.db);
            let output = Output {
                format: cli.format,
                quiet: cli.quiet,
            };
            run_with_backend(&config, &storage, command, output).await
        }
    }
}

/// Storage settings from the config file with command-line overrides applied
fn storage_config(
    config: &Config,
    backend: Option<StorageBackend>,
    db: Option<PathBuf>,
) -> StorageConfig {
    let mut storage = config.storage.clone();
    if let Some(backend) = backend {
        if backend != storage.backend {
            storage.path = None;
        }
        storage.backend = backend;
    }
    if db.is_some() {
        storage.path = db;
    }
    storage
}

async fn run_with_backend(
    config: &Config,
    storage: &StorageConfig,
    command: LockCommand,
    output: Output,
) -> anyhow::Result<()> {
    let lock_config = config.lock_config()?;
    let path = storage.resolved_path();
    debug!(backend = %storage.backend, path = %path.display(), "Opening lock store");

    match storage.backend {
        StorageBackend::Memory => {
            let manager = LockManager::in_memory(lock_config);
            cmd_lock(&manager, command, output).await
        }
        StorageBackend::Sqlite => {
            let db = Database::open(&path).await?;
            let manager = LockManager::new(SqliteLockStore::from_database(&db), lock_config);
            let result = cmd_lock(&manager, command, output).await;
            db.close().await;
            result
        }
        StorageBackend::Json => {
            let store = JsonFileLockStore::open(&path)
                .await
                .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
            let manager = LockManager::new(store, lock_config);
            cmd_lock(&manager, command, output).await
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn print_json(&self, value: &serde_json::Value) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

async fn cmd_lock<S: LockStore>(
    manager: &LockManager<S>,
    command: LockCommand,
    output: Output,
) -> anyhow::Result<()> {
    match command {
        LockCommand::Acquire {
            path,
            shared,
            recursive,
            timeout,
            owner,
            href,
        } => {
            let share_mode = if shared {
                ShareMode::Shared
            } else {
                ShareMode::Exclusive
            };
            let timeout = timeout.unwrap_or(manager.config().default_timeout);
            let mut lock = Lock::new(path, share_mode, timeout).recursive(recursive);
            if let Some(owner) = owner {
                lock = lock.with_owner(owner);
            }
            if let Some(href) = href {
                lock = lock.with_href(href);
            }

            match manager.acquire(lock).await? {
                AcquireOutcome::Acquired(active) => {
                    if output.json() {
                        output.print_json(&lock_json(&active))?;
                    } else if output.quiet {
                        println!("{}", active.state_token);
                    } else {
                        println!("Lock acquired.");
                        print_lock(&active);
                    }
                }
                AcquireOutcome::Conflict(conflicts) => {
                    if output.json() {
                        let conflicts: Vec<_> = conflicts.iter().map(lock_json).collect();
                        output.print_json(&serde_json::json!({ "conflicts": conflicts }))?;
                    } else if !output.quiet {
                        println!("Conflicting locks:");
                        for lock in &conflicts {
                            print_lock(lock);
                        }
                    }
                    return Err(anyhow!(
                        "Lock conflict: {} existing lock(s) prevent the request",
                        conflicts.len()
                    ));
                }
            }
        }

        LockCommand::Refresh { token, timeout } => {
            let timeout = timeout.unwrap_or(manager.config().default_timeout);
            match manager.refresh(&token, timeout).await? {
                RefreshOutcome::Refreshed(active) => {
                    if output.json() {
                        output.print_json(&lock_json(&active))?;
                    } else if !output.quiet {
                        println!("Lock refreshed.");
                        print_lock(&active);
                    }
                }
                RefreshOutcome::NotFound => {
                    return Err(anyhow!(
                        "Lock '{}' not found. Run `davlock list` to see live locks.",
                        token
                    ));
                }
            }
        }

        LockCommand::Release { token, path } => {
            let status = match &path {
                Some(path) => manager.release_at(path, &token).await?,
                None => manager.release(&token).await?,
            };
            if output.json() {
                output.print_json(&serde_json::json!({
                    "state_token": token,
                    "status": status,
                }))?;
            } else if !output.quiet {
                match status {
                    ReleaseStatus::Released => println!("Lock '{}' released.", token),
                    ReleaseStatus::NoLock => println!("No lock '{}' (already released).", token),
                    ReleaseStatus::InvalidLockRange => {}
                }
            }
            if status == ReleaseStatus::InvalidLockRange {
                return Err(anyhow!(
                    "Lock '{}' does not cover '{}'",
                    token,
                    path.unwrap_or_default()
                ));
            }
        }

        LockCommand::ReleaseUnder { path } => {
            let released = manager.release_all_under(&path).await?;
            if output.json() {
                output.print_json(&serde_json::json!({ "path": path, "released": released }))?;
            } else if !output.quiet {
                println!("Released {} lock(s) under {}.", released, path);
            }
        }

        LockCommand::Query { path, recursive } => {
            let status = manager.query_locks(&path, recursive).await?;
            if output.json() {
                output.print_json(&status_json(&status))?;
            } else {
                print_status(&path, &status, output.quiet);
            }
        }

        LockCommand::List => {
            let locks = manager.list_locks().await?;
            if output.json() {
                let locks: Vec<_> = locks.iter().map(lock_json).collect();
                output.print_json(&serde_json::Value::Array(locks))?;
            } else if locks.is_empty() {
                if !output.quiet {
                    println!("No active locks.");
                }
            } else {
                if !output.quiet {
                    println!("Active locks:");
                }
                for lock in &locks {
                    print_lock(lock);
                }
            }
        }

        LockCommand::Show { token } => match manager.get_lock(&token).await? {
            Some(lock) => {
                if output.json() {
                    output.print_json(&lock_json(&lock))?;
                } else {
                    print_lock(&lock);
                }
            }
            None => {
                return Err(anyhow!(
                    "Lock '{}' not found. Run `davlock list` to see live locks.",
                    token
                ));
            }
        },

        LockCommand::Check {
            path,
            recursive,
            tokens,
        } => {
            let presented: Vec<&str> = tokens.iter().map(String::as_str).collect();
            match manager.check_write_access(&path, recursive, &presented).await? {
                WriteAccess::Granted => {
                    if output.json() {
                        output.print_json(&serde_json::json!({ "path": path, "granted": true }))?;
                    } else if !output.quiet {
                        println!("Write to {} allowed.", path);
                    }
                }
                WriteAccess::Denied(blocking) => {
                    if output.json() {
                        let blocking: Vec<_> = blocking.iter().map(lock_json).collect();
                        output.print_json(&serde_json::json!({
                            "path": path,
                            "granted": false,
                            "blocking": blocking,
                        }))?;
                    } else if !output.quiet {
                        println!("Write to {} blocked by:", path);
                        for lock in &blocking {
                            print_lock(lock);
                        }
                    }
                    return Err(anyhow!(
                        "Write to '{}' is locked ({} lock(s) without a presented token)",
                        path,
                        blocking.len()
                    ));
                }
            }
        }

        LockCommand::Purge => {
            let purged = manager.purge_expired().await?;
            if output.json() {
                output.print_json(&serde_json::json!({ "purged": purged }))?;
            } else if !output.quiet {
                println!("Purged {} expired lock(s).", purged);
            }
        }
    }
    Ok(())
}

fn lock_json(lock: &ActiveLock) -> serde_json::Value {
    serde_json::json!({
        "state_token": lock.state_token,
        "path": lock.path,
        "href": lock.href,
        "owner": lock.owner,
        "access_type": lock.access_type.as_str(),
        "share_mode": lock.share_mode.as_str(),
        "recursive": lock.recursive,
        "timeout": lock.timeout.to_string(),
        "issued": lock.issued,
        "last_refresh": lock.last_refresh,
        "expiration": lock.expiration,
    })
}

fn status_json(status: &LockStatus) -> serde_json::Value {
    let section = |locks: &[ActiveLock]| -> Vec<serde_json::Value> {
        locks.iter().map(lock_json).collect()
    };
    serde_json::json!({
        "reference_locks": section(&status.reference_locks),
        "parent_locks": section(&status.parent_locks),
        "child_locks": section(&status.child_locks),
    })
}

fn print_lock(lock: &ActiveLock) {
    let depth = if lock.recursive { "infinity" } else { "0" };
    println!(
        "  {} {} {} (depth {})",
        lock.state_token,
        lock.share_mode.as_str(),
        lock.path,
        depth
    );
    if let Some(owner) = &lock.owner {
        println!("      owner: {}", owner);
    }
    if lock.timeout.is_infinite() {
        println!("      timeout: infinite");
    } else {
        println!(
            "      timeout: {}, expires {}",
            lock.timeout,
            lock.expiration.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}

fn print_status(path: &str, status: &LockStatus, quiet: bool) {
    if status.is_empty() {
        if !quiet {
            println!("No locks affect {}.", path);
        }
        return;
    }

    let sections = [
        ("On the resource", &status.reference_locks),
        ("On ancestors", &status.parent_locks),
        ("On descendants", &status.child_locks),
    ];
    for (title, locks) in sections {
        if locks.is_empty() {
            continue;
        }
        if !quiet {
            println!("{}:", title);
        }
        for lock in locks {
            print_lock(lock);
        }
    }
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(storage: &StorageConfig, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Davlock Health Check");
        println!("====================");
        println!();
    }

    let mut all_ok = true;

    match Config::config_path() {
        Ok(path) if path.exists() => {
            if !quiet {
                println!("[OK] Config file: {}", path.display());
            }
        }
        Ok(path) => {
            if !quiet {
                println!("[--] Config file: {} (using defaults)", path.display());
            }
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Config file: Error - {}", e);
            }
        }
    }

    let path = storage.resolved_path();
    match storage.backend {
        StorageBackend::Memory => {
            if !quiet {
                println!("[--] Storage: in-memory (locks are not persisted)");
            }
        }
        StorageBackend::Sqlite => match Database::open(&path).await {
            Ok(db) => {
                match db.health_check().await {
                    Ok(()) => {
                        if !quiet {
                            println!("[OK] Database: Connected");
                            println!("     Path: {}", db.path().display());
                        }
                        match db.migration_status().await {
                            Ok(status) if status.needs_migration => {
                                all_ok = false;
                                if !quiet {
                                    println!(
                                        "[!!] Database: Migrations pending (v{} -> v{})",
                                        status.current_version, status.target_version
                                    );
                                }
                            }
                            Ok(status) => {
                                if !quiet {
                                    println!("[OK] Database: Schema v{}", status.current_version);
                                }
                            }
                            Err(e) => {
                                all_ok = false;
                                if !quiet {
                                    println!("[!!] Database: Migration check failed - {}", e);
                                }
                            }
                        }
                        let manager =
                            LockManager::new(SqliteLockStore::from_database(&db), LockConfig::default());
                        report_lock_count(&manager, quiet, &mut all_ok).await;
                    }
                    Err(e) => {
                        all_ok = false;
                        if !quiet {
                            println!("[!!] Database: Health check failed - {}", e);
                        }
                    }
                }
                db.close().await;
            }
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Database: Failed to open - {}", e);
                }
            }
        },
        StorageBackend::Json => match JsonFileLockStore::open(&path).await {
            Ok(store) => {
                if !quiet {
                    println!("[OK] Lock file: {}", store.path().display());
                }
                let manager = LockManager::new(store, LockConfig::default());
                report_lock_count(&manager, quiet, &mut all_ok).await;
            }
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Lock file: {} - {}", path.display(), e);
                }
            }
        },
    }

    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }

    Ok(())
}

async fn report_lock_count<S: LockStore>(manager: &LockManager<S>, quiet: bool, all_ok: &mut bool) {
    match manager.list_locks().await {
        Ok(locks) => {
            if !quiet {
                println!("     Live locks: {}", locks.len());
            }
        }
        Err(e) => {
            *all_ok = false;
            warn!(error = %e, "Failed to read locks");
            if !quiet {
                println!("[!!] Locks: {} ({})", e, e.code());
            }
        }
    }
}
