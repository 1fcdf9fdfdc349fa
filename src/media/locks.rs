//! Keyed Lock Table
//!
//! An arena of async locks indexed by resource key. Entries are created
//! lazily on first use and reclaimed once idle for longer than the
//! configured window. Losing an idle entry is harmless: it only matters
//! while two requests for the same key overlap in time.
//!
//! An entry that is held or awaited (another `Arc` is alive) is never
//! reclaimed, so a waiter can never end up on a different lock than the
//! current holder.
//!
//! Each entry also counts finished fill attempts. A caller that waited
//! while another holder's attempt failed can see that through
//! [`KeyGuard::failed_while_waiting`] and share the outcome instead of
//! starting a second fetch.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default inactivity window after which an entry may be reclaimed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Lock for one key.
#[derive(Default)]
pub struct KeyLock {
    gate: Arc<Mutex<()>>,
    attempts: AtomicU64,
    last_failed: AtomicBool,
}

/// Exclusive access to one key, released on drop.
pub struct KeyGuard {
    _gate: OwnedMutexGuard<()>,
    lock: Arc<KeyLock>,
    /// Attempts finished before this caller queued up
    seen: u64,
}

impl KeyGuard {
    /// Whether an attempt finished while this caller was waiting and it
    /// failed.
    pub fn failed_while_waiting(&self) -> bool {
        self.lock.attempts.load(Ordering::Acquire) > self.seen
            && self.lock.last_failed.load(Ordering::Acquire)
    }

    /// Record the result of the attempt made under this guard.
    pub fn finish_attempt(&self, failed: bool) {
        self.lock.last_failed.store(failed, Ordering::Release);
        self.lock.attempts.fetch_add(1, Ordering::AcqRel);
    }
}

struct LockSlot {
    lock: Arc<KeyLock>,
    last_used: Instant,
}

/// Concurrent per-key lock table with idle expiry.
pub struct KeyedLocks {
    slots: DashMap<String, LockSlot>,
    idle_timeout: Duration,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl KeyedLocks {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            idle_timeout,
        }
    }

    /// Acquire the exclusive lock for `key`, waiting for the current holder.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| LockSlot {
                lock: Arc::new(KeyLock::default()),
                last_used: Instant::now(),
            });
            slot.last_used = Instant::now();
            Arc::clone(&slot.lock)
        };
        let seen = lock.attempts.load(Ordering::Acquire);
        let gate = Arc::clone(&lock.gate).lock_owned().await;
        KeyGuard {
            _gate: gate,
            lock,
            seen,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop entries idle for longer than the window and not in use.
    /// Returns the number of entries removed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let removed = AtomicUsize::new(0);
        self.slots.retain(|_, slot| {
            // Cloning happens under the same shard lock, so a count of one
            // means nobody holds or waits on this entry.
            let in_use = Arc::strong_count(&slot.lock) > 1;
            let keep = in_use || now.duration_since(slot.last_used) < self.idle_timeout;
            if !keep {
                removed.fetch_add(1, Ordering::Relaxed);
            }
            keep
        });
        removed.into_inner()
    }
}

/// Periodically reclaim idle lock entries until cancelled.
pub fn spawn_lock_reaper(
    locks: Arc<KeyedLocks>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let removed = locks.reap_idle();
                    crate::metrics::set_lock_table_entries(locks.len());
                    if removed > 0 {
                        debug!(removed, remaining = locks.len(), "Reaped idle download locks");
                    }
                }
            }
        }
    })
}
