//! Configuration
//!
//! Command line / environment arguments and their validated form. Every
//! validation failure is fatal at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::adapters::{FetcherConfig, DEFAULT_USER_AGENT};
use crate::error::{Error, Result};
use crate::media::{ShardAssignment, ShardFilter, ShardHashScope, SweeperConfig};

/// How `/media/...` requests are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ServeMode {
    /// Temporary redirect to the canonical origin URL
    #[default]
    Redirect,
    /// Fetch through the cache and answer with the file bytes
    ServeInline,
}

/// Where last-access records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LedgerBackend {
    #[default]
    Redis,
    /// Process-local; single node only, lost on restart
    Memory,
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Booru CDN - Sharded media cache for booru video origins
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Media server bind address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Metrics and health server bind address
    #[arg(long, env = "ADMIN_ADDR", default_value = "0.0.0.0:9090")]
    pub admin_addr: String,

    /// Cache root; media is stored below `<root>/media`
    #[arg(long, env = "CACHE_ROOT", default_value = "/cdn")]
    pub cache_root: PathBuf,

    /// Directory of proxy downloads, relative to the cache root unless absolute
    #[arg(long, env = "PROXY_DIR", default_value = "proxy")]
    pub proxy_dir: PathBuf,

    /// Answer /media requests with a redirect or the file itself
    #[arg(long = "mode", env = "SERVE_MODE", value_enum, default_value = "redirect")]
    pub serve_mode: ServeMode,

    /// Only serve keys that hash to one of the local shards
    #[arg(long, env = "SHARD_BLOCKING")]
    pub shard_blocking: bool,

    /// Total number of shards in the cluster
    #[arg(long, env = "MAX_SHARDS")]
    pub max_shards: Option<u32>,

    /// Comma-separated shard ids owned by this node
    #[arg(long, env = "SHARDS")]
    pub shards: Option<String>,

    /// Input of the shard hash
    #[arg(long, env = "SHARD_HASH_SCOPE", value_enum, default_value = "legacy")]
    pub shard_hash_scope: ShardHashScope,

    /// Shared secret for /proxy_download
    #[arg(long, env = "AUTH", hide_env_values = true)]
    pub auth: Option<String>,

    /// Access ledger backend
    #[arg(long, env = "LEDGER", value_enum, default_value = "redis")]
    pub ledger: LedgerBackend,

    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value = "6379")]
    pub redis_port: u16,

    /// Run the daily eviction sweep on this node
    #[arg(long, env = "CACHE_CLEANER")]
    pub cache_cleaner: bool,

    /// Days after the last access before a file is evicted
    #[arg(long, env = "RETENTION_DAYS", default_value = "30")]
    pub retention_days: u32,

    /// Hours between eviction sweeps
    #[arg(long, env = "SWEEP_INTERVAL_HOURS", default_value = "24")]
    pub sweep_interval_hours: u64,

    /// Upstream connect timeout in seconds
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "3")]
    pub connect_timeout_secs: u64,

    /// Upstream total timeout in seconds
    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS", default_value = "30")]
    pub download_timeout_secs: u64,

    /// Follow redirects on media downloads
    #[arg(
        long,
        env = "DOWNLOAD_FOLLOW_REDIRECTS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub download_follow_redirects: bool,

    /// Follow redirects on proxy downloads
    #[arg(
        long,
        env = "PROXY_FOLLOW_REDIRECTS",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub proxy_follow_redirects: bool,

    /// Referer sent with proxy downloads
    #[arg(long, env = "PROXY_REFERER", default_value = "https://app-api.pixiv.net")]
    pub proxy_referer: String,

    /// User agent sent upstream
    #[arg(long, env = "USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

// =============================================================================
// Validated Configuration
// =============================================================================

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub cache_root: PathBuf,
    pub proxy_dir: PathBuf,
    pub serve_mode: ServeMode,
    pub shard_filter: ShardFilter,
    pub auth: Option<String>,
    pub ledger: LedgerBackend,
    pub redis_host: String,
    pub redis_port: u16,
    /// Present when this node runs the eviction sweep
    pub sweeper: Option<SweeperConfig>,
    pub download_fetcher: FetcherConfig,
    pub proxy_fetcher: FetcherConfig,
    pub proxy_referer: String,
}

impl AppConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let listen_addr = parse_addr("listen", &args.listen_addr)?;
        let admin_addr = parse_addr("admin", &args.admin_addr)?;

        if args.connect_timeout_secs == 0 || args.download_timeout_secs == 0 {
            return Err(Error::Config("Timeouts must be greater than zero".into()));
        }
        if args.retention_days == 0 {
            return Err(Error::Config("Retention must be at least one day".into()));
        }
        if args.sweep_interval_hours == 0 {
            return Err(Error::Config("Sweep interval must be at least one hour".into()));
        }

        let shard_filter = if args.shard_blocking {
            ShardFilter::enabled(
                parse_assignment(args.max_shards, args.shards.as_deref())?,
                args.shard_hash_scope,
            )
        } else {
            ShardFilter::disabled()
        };

        let sweeper = args.cache_cleaner.then(|| SweeperConfig {
            retention: chrono::Duration::days(i64::from(args.retention_days)),
            interval: Duration::from_secs(args.sweep_interval_hours.saturating_mul(3600)),
            ..Default::default()
        });

        let fetcher = |follow_redirects| FetcherConfig {
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            timeout: Duration::from_secs(args.download_timeout_secs),
            follow_redirects,
            user_agent: args.user_agent.clone(),
        };

        Ok(Self {
            listen_addr,
            admin_addr,
            cache_root: args.cache_root.clone(),
            proxy_dir: args.proxy_dir.clone(),
            serve_mode: args.serve_mode,
            shard_filter,
            auth: args.auth.clone().filter(|secret| !secret.is_empty()),
            ledger: args.ledger,
            redis_host: args.redis_host.clone(),
            redis_port: args.redis_port,
            sweeper,
            download_fetcher: fetcher(args.download_follow_redirects),
            proxy_fetcher: fetcher(args.proxy_follow_redirects),
            proxy_referer: args.proxy_referer.clone(),
        })
    }

    /// Root of the per-origin media tree.
    pub fn media_root(&self) -> PathBuf {
        self.cache_root.join("media")
    }

    /// Directory of proxy downloads.
    pub fn proxy_root(&self) -> PathBuf {
        self.cache_root.join(&self.proxy_dir)
    }
}

fn parse_addr(name: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Config(format!("Invalid {} address {:?}: {}", name, addr, e)))
}

fn parse_assignment(max_shards: Option<u32>, shards: Option<&str>) -> Result<ShardAssignment> {
    let total = match max_shards {
        Some(total) if total > 0 && total <= i32::MAX as u32 => total,
        _ => {
            return Err(Error::Config(
                "Shard blocking requires MAX_SHARDS between 1 and 2^31-1".into(),
            ))
        }
    };

    let raw = shards.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
        Error::Config("Shard blocking requires a non-empty SHARDS list".into())
    })?;

    let mut local = Vec::new();
    for part in raw.split(',') {
        let id: u32 = part
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("Invalid shard id {:?}", part)))?;
        if id >= total {
            return Err(Error::Config(format!(
                "Shard id {} out of range for {} shards",
                id, total
            )));
        }
        local.push(id);
    }
    Ok(ShardAssignment::new(total, local))
}
