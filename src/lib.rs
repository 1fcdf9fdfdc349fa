//! Booru CDN - Sharded media cache for booru video origins
//!
//! A caching reverse proxy in front of a fixed set of booru media hosts.
//! Requests naming a video on one of the origins are validated, checked
//! against this node's shard assignment, downloaded at most once per
//! resource and kept on local disk until a daily sweep evicts files that
//! have not been requested within the retention period.
//!
//! # Architecture
//!
//! ```text
//! Router → Validator → Shard Filter → Download Coordinator → Cache Store
//!                                                                 ↑
//!                                                Sweeper (daily) ─┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`config`] - CLI / environment configuration
//! - [`domain`] - Value objects and ports
//! - [`error`] - Error types
//! - [`media`] - Validation, sharding, downloads, storage and eviction
//! - [`metrics`] - Prometheus metrics
//! - [`server`] - Media and admin HTTP servers

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod media;
pub mod metrics;
pub mod server;

// Re-export commonly used types
pub use config::{AppConfig, Args, ServeMode};
pub use domain::{Origin, ResourceKey};
pub use error::{Error, Result};
pub use media::{CacheStore, CacheSweeper, DownloadCoordinator, KeyedLocks, ShardFilter};
pub use server::MediaRouter;
