//! Cache Store
//!
//! On-disk layout of cached media plus the last-access ledger.
//!
//! # Layout
//!
//! ```text
//! <media_root>/
//! ├── .partial/                 in-flight downloads (uuid.part)
//! ├── rule34/<id>/<file>
//! ├── danbooru/<xx>/<yy>/<file>
//! └── realbooru/<xx>/<yy>/<file>
//! ```
//!
//! Files only become visible under their final name through a rename after
//! their content has been synced, so readers checking existence without a
//! lock never observe a partial file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::domain::{AccessLedger, BodyStream, ResourceKey};
use crate::error::{Error, Result};

/// Directory for in-flight downloads below a root.
pub const PARTIAL_DIR: &str = ".partial";

/// Age after which a partial file can no longer belong to a live download.
/// Well above any download timeout.
pub const STALE_PARTIAL_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Filesystem layout plus access ledger.
pub struct CacheStore {
    media_root: PathBuf,
    ledger: Arc<dyn AccessLedger>,
}

impl CacheStore {
    pub fn new(media_root: impl Into<PathBuf>, ledger: Arc<dyn AccessLedger>) -> Self {
        Self {
            media_root: media_root.into(),
            ledger,
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.media_root.join(PARTIAL_DIR)
    }

    /// Absolute path of a key's cached file.
    pub fn path_for(&self, key: &ResourceKey) -> PathBuf {
        self.media_root.join(key.relative_path())
    }

    /// Whether the key is cached. Lock-free; relies on rename-into-place.
    pub async fn exists(&self, key: &ResourceKey) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(key)).await?)
    }

    /// Create the directory that will hold the key's file.
    pub async fn ensure_parent(&self, key: &ResourceKey) -> Result<()> {
        if let Some(parent) = self.path_for(key).parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Stream the key's content to disk and publish it under its final
    /// name. Returns the number of bytes written.
    pub async fn publish(&self, key: &ResourceKey, body: BodyStream) -> Result<u64> {
        write_atomically(&self.partial_dir(), &self.path_for(key), body).await
    }

    /// Overwrite the key's access record with the current time.
    pub async fn record_access(&self, key: &ResourceKey) -> Result<()> {
        self.ledger.set(&key.to_string(), Utc::now()).await
    }

    pub async fn last_access(&self, key: &ResourceKey) -> Result<Option<DateTime<Utc>>> {
        self.ledger.get(&key.to_string()).await
    }

    /// Create the root and discard partial files older than `stale_after`.
    /// Younger ones may belong to another process sharing the root.
    pub async fn prepare(&self, stale_after: Duration) -> Result<()> {
        fs::create_dir_all(self.partial_dir()).await?;
        let removed = remove_stale_partials(&self.partial_dir(), stale_after).await?;
        if removed > 0 {
            info!(removed, "Removed orphaned partial downloads");
        }
        Ok(())
    }
}

/// Stream `body` into a temp file in `partial_dir`, sync it, then rename it
/// to `dest`. The temp file is removed if any step fails, including a body
/// that breaks off part way.
pub async fn write_atomically(
    partial_dir: &Path,
    dest: &Path,
    mut body: BodyStream,
) -> Result<u64> {
    fs::create_dir_all(partial_dir).await?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp = partial_dir.join(format!("{}.part", uuid::Uuid::new_v4()));

    let result = async {
        let mut file = fs::File::create(&temp).await?;
        let mut written = 0u64;
        while let Some(chunk) = body.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, dest).await?;
        Ok::<_, Error>(written)
    }
    .await;

    if result.is_err() {
        if let Err(cleanup) = fs::remove_file(&temp).await {
            if cleanup.kind() != ErrorKind::NotFound {
                warn!(path = %temp.display(), error = %cleanup, "Failed to remove partial file");
            }
        }
    }
    result
}

/// Remove partial files whose modification time is older than `min_age`.
pub async fn remove_stale_partials(partial_dir: &Path, min_age: Duration) -> Result<usize> {
    let mut entries = match fs::read_dir(partial_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        if age < min_age {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove partial file"),
        }
    }
    Ok(removed)
}
