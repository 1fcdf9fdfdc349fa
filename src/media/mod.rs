//! Media Cache Module
//!
//! Request validation, shard ownership, single-flight downloads and
//! time-based eviction of cached media.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Media Cache                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────────────────────┐  │
//! │  │ Validator  │──▶│   Shard    │──▶│   Download Coordinator      │  │
//! │  │ (origins)  │   │   Filter   │   │   (keyed locks, fetcher)    │  │
//! │  └────────────┘   └────────────┘   └──────────────┬──────────────┘  │
//! │                                                   │                  │
//! │                                        ┌──────────┴──────────┐       │
//! │                                        │     Cache Store     │       │
//! │                                        │  (files + ledger)   │       │
//! │                                        └──────────┬──────────┘       │
//! │                                                   │                  │
//! │                                        ┌──────────┴──────────┐       │
//! │                                        │      Sweeper        │       │
//! │                                        └─────────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Origins** (`origin.rs`): static descriptors of the supported hosts
//!   with their URL templates, directory patterns and extension whitelists.
//! - **Validator** (`validator.rs`): turns inbound paths into resource keys.
//! - **Shard Filter** (`shard.rs`): decides whether this node owns a key.
//! - **Keyed Locks** (`locks.rs`): per-key mutual exclusion with idle expiry.
//! - **Cache Store** (`store.rs`): file layout, atomic publish, access ledger.
//! - **Download Coordinator** (`downloader.rs`): single-flight fetch.
//! - **Sweeper** (`sweeper.rs`): daily eviction of unused files.
//! - **Proxy Downloader** (`proxy.rs`): shared-secret pass-through downloads.

pub mod downloader;
pub mod locks;
pub mod origin;
pub mod proxy;
pub mod shard;
pub mod store;
pub mod sweeper;
pub mod validator;

pub use downloader::{CacheOutcome, DownloadCoordinator};
pub use locks::{spawn_lock_reaper, KeyGuard, KeyedLocks, DEFAULT_IDLE_TIMEOUT};
pub use origin::{descriptor, OriginDescriptor, VIDEO_EXTENSIONS};
pub use proxy::{ProxyDownloader, ProxyOutcome, ProxyTarget};
pub use shard::{shard_of, ShardAssignment, ShardFilter, ShardHashScope};
pub use store::{write_atomically, CacheStore, STALE_PARTIAL_AGE};
pub use sweeper::{CacheSweeper, OriginSweepStats, SweepReport, SweeperConfig};
pub use validator::{parse, parse_resource, ParsedRequest, Rejection};
