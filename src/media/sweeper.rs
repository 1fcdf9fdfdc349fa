//! Cache Sweeper
//!
//! Time-based eviction of cached media. Runs on a dedicated task: first
//! sweep immediately, then once per interval (daily by default).
//!
//! For every origin the sweeper walks `<media_root>/<origin>` at the
//! origin's directory depth, derives each file's resource key from its path
//! and deletes the file when its last access is older than the retention
//! period. A file without an access record counts as infinitely old.
//!
//! The sweeper only deletes and request handling only creates, so no lock
//! is taken. A request may see a file the sweeper removes an instant later;
//! the next request for it downloads it again.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{Origin, ResourceKey};
use crate::error::Result;

use super::origin::descriptor;
use super::store::{remove_stale_partials, CacheStore, STALE_PARTIAL_AGE};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the cache sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Files last accessed longer ago than this are deleted
    pub retention: chrono::Duration,

    /// Time between sweeps
    pub interval: Duration,

    /// Partial downloads older than this are crash leftovers
    pub partial_max_age: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::days(30),
            interval: Duration::from_secs(24 * 60 * 60),
            partial_max_age: STALE_PARTIAL_AGE,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Per-origin sweep counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OriginSweepStats {
    pub origin: String,
    pub scanned: u64,
    pub deleted: u64,
    pub failed: u64,
    /// Set when the origin's iteration was abandoned
    pub error: Option<String>,
}

/// Result of one sweep over all origins
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub partials_removed: usize,
    pub origins: Vec<OriginSweepStats>,
}

impl SweepReport {
    pub fn origin(&self, origin: Origin) -> Option<&OriginSweepStats> {
        self.origins.iter().find(|s| s.origin == origin.as_str())
    }

    pub fn total_deleted(&self) -> u64 {
        self.origins.iter().map(|s| s.deleted).sum()
    }
}

// =============================================================================
// Sweeper
// =============================================================================

/// Reconciles cached files against the access ledger.
pub struct CacheSweeper {
    store: Arc<CacheStore>,
    config: SweeperConfig,
}

impl CacheSweeper {
    pub fn new(store: Arc<CacheStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run one sweep against the current time.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep treating `now` as the current time.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let started_at = Utc::now();
        info!("Starting cache sweep");

        let partials_removed =
            match remove_stale_partials(&self.store.partial_dir(), self.config.partial_max_age).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(error = %e, "Failed to clean partial downloads");
                    0
                }
            };

        let mut origins = Vec::with_capacity(Origin::ALL.len());
        for origin in Origin::ALL {
            let mut stats = OriginSweepStats {
                origin: origin.as_str().to_string(),
                ..Default::default()
            };
            if let Err(e) = self.sweep_origin(origin, now, &mut stats).await {
                error!(origin = %origin, error = %e, "Cache sweep of origin abandoned");
                stats.error = Some(e.to_string());
            }
            info!(
                origin = %origin,
                scanned = stats.scanned,
                deleted = stats.deleted,
                failed = stats.failed,
                "Cache sweep completed"
            );
            crate::metrics::record_sweep(origin, stats.scanned, stats.deleted, stats.failed);
            origins.push(stats);
        }

        SweepReport {
            started_at,
            finished_at: Utc::now(),
            partials_removed,
            origins,
        }
    }

    async fn sweep_origin(
        &self,
        origin: Origin,
        now: DateTime<Utc>,
        stats: &mut OriginSweepStats,
    ) -> Result<()> {
        let root = self.store.media_root().join(origin.as_str());
        let depth = descriptor(origin).directory_depth;

        // Walk down one directory level at a time, carrying the segments.
        let mut level: Vec<(PathBuf, Vec<String>)> = vec![(root, Vec::new())];
        for _ in 0..depth {
            let mut next = Vec::new();
            for (dir, segments) in level {
                for (path, name, is_dir) in list_dir(&dir).await? {
                    if is_dir {
                        let mut segments = segments.clone();
                        segments.push(name);
                        next.push((path, segments));
                    }
                }
            }
            level = next;
        }

        for (dir, segments) in level {
            for (path, name, is_dir) in list_dir(&dir).await? {
                if is_dir {
                    continue;
                }
                stats.scanned += 1;
                let key = ResourceKey::new(origin, segments.clone(), name);
                if !self.is_expired(&key, now).await? {
                    continue;
                }
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(key = %key, "Evicted cached media");
                        stats.deleted += 1;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to evict cached media");
                        stats.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn is_expired(&self, key: &ResourceKey, now: DateTime<Utc>) -> Result<bool> {
        let expired = match self.store.last_access(key).await? {
            Some(last) => match last.checked_add_signed(self.config.retention) {
                Some(expires_at) => now > expires_at,
                None => false,
            },
            None => true,
        };
        Ok(expired)
    }

    /// Sweep now and then every interval until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                retention_days = self.config.retention.num_days(),
                "Starting cache sweeper"
            );
            let mut tick = tokio::time::interval(self.config.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Cache sweeper shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        let report = self.sweep().await;
                        debug!(
                            deleted = report.total_deleted(),
                            report = %serde_json::to_string(&report).unwrap_or_default(),
                            "Cache sweep finished"
                        );
                    }
                }
            }
        })
    }
}

/// Entries of a directory as `(path, name, is_dir)`. A missing directory
/// is empty; entries with non UTF-8 names are skipped.
async fn list_dir(dir: &Path) -> Result<Vec<(PathBuf, String, bool)>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let is_dir = entry.file_type().await?.is_dir();
        out.push((entry.path(), name, is_dir));
    }
    Ok(out)
}
