//! JSON document lock store
//!
//! The whole lock table lives in one JSON file. Every committed transaction
//! writes a temporary sibling, syncs it, renames it over the document and
//! syncs the directory, so a crash leaves either the old or the new document
//! on disk. Only a missing file means "no locks"; an empty or unreadable one
//! is reported as corrupted.
//!
//! ```text
//! {
//!   "version": 1,
//!   "saved_at": "2024-05-01T12:00:00Z",
//!   "locks": [ { "state_token": "urn:uuid:...", "path": "/docs", ... } ]
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::locking::{ActiveLock, LockStore, LockTransaction};
use crate::error::{Error, Result};

use super::memory::{LockMap, SnapshotTransaction};

/// Document format version written by this build
pub const DOCUMENT_VERSION: u32 = 1;

/// On-disk layout of the lock file
#[derive(Debug, Serialize, Deserialize)]
struct LockDocument {
    version: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    locks: Vec<ActiveLock>,
}

/// Lock store persisted to a single JSON file
#[derive(Debug, Clone)]
pub struct JsonFileLockStore {
    path: PathBuf,
    locks: Arc<Mutex<LockMap>>,
}

impl JsonFileLockStore {
    /// Open the lock file at `path`, starting empty if it does not exist yet
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let locks = read_document(&path).await?;

        tracing::debug!(path = %path.display(), locks = locks.len(), "Opened JSON lock store");

        Ok(Self {
            path,
            locks: Arc::new(Mutex::new(locks)),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LockStore for JsonFileLockStore {
    async fn begin(&self) -> Result<Box<dyn LockTransaction>> {
        let committed = Arc::clone(&self.locks).lock_owned().await;
        Ok(Box::new(SnapshotTransaction::new(
            committed,
            Some(self.path.clone()),
        )))
    }
}

async fn read_document(path: &Path) -> Result<LockMap> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockMap::new()),
        Err(e) => return Err(e.into()),
    };

    if content.trim().is_empty() {
        return Err(Error::Corrupted(format!("{}: empty lock document", path.display())));
    }

    let document: LockDocument = serde_json::from_str(&content)
        .map_err(|e| Error::Corrupted(format!("{}: {}", path.display(), e)))?;

    if document.version > DOCUMENT_VERSION {
        return Err(Error::Corrupted(format!(
            "{}: unsupported document version {}",
            path.display(),
            document.version
        )));
    }

    let mut locks = LockMap::with_capacity(document.locks.len());
    for lock in document.locks {
        if locks.contains_key(&lock.state_token) {
            return Err(Error::Corrupted(format!(
                "{}: duplicate state token {}",
                path.display(),
                lock.state_token
            )));
        }
        locks.insert(lock.state_token.clone(), lock);
    }
    Ok(locks)
}

/// Write `locks` to `path` atomically
pub(crate) async fn write_document(path: &Path, locks: &LockMap) -> Result<()> {
    let mut sorted: Vec<ActiveLock> = locks.values().cloned().collect();
    sorted.sort_by(|a, b| a.issued.cmp(&b.issued).then_with(|| a.state_token.cmp(&b.state_token)));

    let document = LockDocument {
        version: DOCUMENT_VERSION,
        saved_at: Utc::now(),
        locks: sorted,
    };
    let content = serde_json::to_string_pretty(&document)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path)?;
    write_and_sync(&tmp, content.as_bytes()).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    sync_parent_dir(path).await
}

/// `.{filename}.tmp` next to the target
fn temp_path(target: &Path) -> Result<PathBuf> {
    let filename = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("invalid lock file path '{}'", target.display())))?;
    Ok(target.with_file_name(format!(".{}.tmp", filename)))
}

async fn write_and_sync(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    let written = async {
        file.write_all(content).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        drop(file);
        let _ = tokio::fs::remove_file(path).await;
        return Err(e.into());
    }
    Ok(())
}

/// Make the rename itself durable
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}
