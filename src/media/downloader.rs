//! Download Coordinator
//!
//! Single-flight download of remote media into the cache.
//!
//! # Flow
//!
//! ```text
//! ensure_cached(key, url)
//!   └─ detached task
//!        ├─ lock(key)                    waiters queue here
//!        ├─ exists? ──yes──▶ Cached      file written by a prior holder
//!        ├─ failed while waiting? ─▶ Missing   share the attempt just made
//!        ├─ create parent dir            failure ⇒ Err (internal)
//!        ├─ fetch(url)                   failure ⇒ Missing (logged)
//!        ├─ stream to temp + rename      failure ⇒ Missing (logged)
//!        └─ unlock
//! ```
//!
//! The locked section runs on its own task, so a caller that goes away does
//! not abort a fetch other waiters may be blocked on. Failed fetches are not
//! retried here; the next request for the key tries again.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::domain::{FetchRequest, Fetcher, ResourceKey};
use crate::error::{Error, Result};

use super::locks::KeyedLocks;
use super::store::CacheStore;

/// Result of [`DownloadCoordinator::ensure_cached`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The file is on disk at this path
    Cached(PathBuf),
    /// The fetch failed; a later request will retry it
    Missing,
}

impl CacheOutcome {
    pub fn is_cached(&self) -> bool {
        matches!(self, CacheOutcome::Cached(_))
    }
}

/// Serializes downloads per resource key.
#[derive(Clone)]
pub struct DownloadCoordinator {
    store: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    locks: Arc<KeyedLocks>,
}

impl DownloadCoordinator {
    pub fn new(store: Arc<CacheStore>, fetcher: Arc<dyn Fetcher>, locks: Arc<KeyedLocks>) -> Self {
        Self {
            store,
            fetcher,
            locks,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<KeyedLocks> {
        &self.locks
    }

    /// Make sure `key` is on disk, downloading it from `source_url` at most
    /// once across all concurrent callers.
    #[instrument(skip(self, source_url), fields(key = %key))]
    pub async fn ensure_cached(&self, key: &ResourceKey, source_url: &str) -> Result<CacheOutcome> {
        let this = self.clone();
        let key = key.clone();
        let request = FetchRequest::new(source_url);

        tokio::spawn(async move { this.fill(&key, &request).await })
            .await
            .map_err(|e| Error::Internal(format!("Download task failed: {}", e)))?
    }

    async fn fill(&self, key: &ResourceKey, request: &FetchRequest) -> Result<CacheOutcome> {
        let guard = self.locks.lock(&key.to_string()).await;

        if self.store.exists(key).await? {
            debug!(key = %key, "Cache hit");
            crate::metrics::record_download(key.origin(), "hit");
            return Ok(CacheOutcome::Cached(self.store.path_for(key)));
        }
        if guard.failed_while_waiting() {
            debug!(key = %key, "Sharing failed outcome of concurrent download");
            return Ok(CacheOutcome::Missing);
        }

        self.store.ensure_parent(key).await?;

        let outcome = self.download(key, request).await;
        guard.finish_attempt(!outcome.is_cached());
        Ok(outcome)
    }

    async fn download(&self, key: &ResourceKey, request: &FetchRequest) -> CacheOutcome {
        let host = request.host();
        info!(key = %key, host = %host, "Downloading media");

        let body = match self.fetcher.fetch_ok(request).await {
            Ok(body) => body,
            Err(e) => {
                warn!(key = %key, host = %host, error = %e, "Media download failed");
                crate::metrics::record_download(key.origin(), "failed");
                return CacheOutcome::Missing;
            }
        };

        match self.store.publish(key, body.body).await {
            Ok(bytes) => {
                info!(key = %key, bytes, "Media download complete");
                crate::metrics::record_download(key.origin(), "downloaded");
                CacheOutcome::Cached(self.store.path_for(key))
            }
            Err(e) if e.is_fetch_failure() => {
                warn!(key = %key, host = %host, error = %e, "Media download broke off");
                crate::metrics::record_download(key.origin(), "failed");
                CacheOutcome::Missing
            }
            Err(e) => {
                error!(key = %key, host = %host, error = %e, "Failed to store downloaded media");
                crate::metrics::record_download(key.origin(), "failed");
                CacheOutcome::Missing
            }
        }
    }
}
