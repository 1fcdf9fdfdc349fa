//! Booru CDN
//!
//! Media-caching reverse proxy for booru video origins.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Booru CDN                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Media     │───▶│   Download   │───▶│    Cache     │       │
//! │  │    Router    │    │ Coordinator  │    │    Store     │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │                                                  │               │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────┴───────┐       │
//! │  │    Admin     │    │ Lock Reaper  │    │   Sweeper    │       │
//! │  │   Server     │    │              │    │   (daily)    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use booru_cdn::adapters::{HttpFetcher, InMemoryLedger, RedisLedger};
use booru_cdn::config::{AppConfig, Args, LedgerBackend};
use booru_cdn::domain::AccessLedger;
use booru_cdn::media::{
    spawn_lock_reaper, CacheStore, CacheSweeper, DownloadCoordinator, KeyedLocks,
    ProxyDownloader, STALE_PARTIAL_AGE,
};
use booru_cdn::server::{run_admin_server, run_media_server, AdminState, MediaRouter};

/// How often idle download locks are reclaimed.
const LOCK_REAP_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = AppConfig::from_args(&args).context("Invalid configuration")?;

    info!("Starting Booru CDN");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Admin address: {}", config.admin_addr);
    info!("  Cache root: {}", config.cache_root.display());
    info!("  Serve mode: {:?}", config.serve_mode);
    info!("  Shard blocking: {}", config.shard_filter.is_enabled());
    info!("  Cache cleaner: {}", config.sweeper.is_some());
    info!("  Proxy download: {}", if config.auth.is_some() { "enabled" } else { "disabled" });

    // Access ledger
    let ledger: Arc<dyn AccessLedger> = match config.ledger {
        LedgerBackend::Redis => Arc::new(
            RedisLedger::connect(&config.redis_host, config.redis_port)
                .await
                .context("Failed to connect to Redis")?,
        ),
        LedgerBackend::Memory => {
            warn!("Using in-memory access ledger; records are lost on restart");
            Arc::new(InMemoryLedger::new())
        }
    };

    // Cache layout
    let store = Arc::new(CacheStore::new(config.media_root(), ledger));
    let stale_after = config
        .sweeper
        .as_ref()
        .map_or(STALE_PARTIAL_AGE, |sweeper| sweeper.partial_max_age);
    store
        .prepare(stale_after)
        .await
        .context("Failed to prepare media root")?;
    tokio::fs::create_dir_all(config.proxy_root())
        .await
        .context("Failed to create proxy root")?;

    // Download path
    let locks = Arc::new(KeyedLocks::default());
    let download_fetcher = Arc::new(HttpFetcher::new(config.download_fetcher.clone())?);
    let proxy_fetcher = Arc::new(HttpFetcher::new(config.proxy_fetcher.clone())?);

    let coordinator = DownloadCoordinator::new(store.clone(), download_fetcher, locks.clone());
    let proxy = Arc::new(ProxyDownloader::new(
        config.proxy_root(),
        proxy_fetcher,
        locks.clone(),
        config.proxy_referer.clone(),
        config.auth.clone(),
    ));
    let router = MediaRouter::new(
        config.serve_mode,
        config.shard_filter.clone(),
        coordinator,
        proxy,
    );

    let shutdown = CancellationToken::new();
    let mut background = vec![spawn_lock_reaper(locks, LOCK_REAP_INTERVAL, shutdown.clone())];

    // Eviction sweep
    if let Some(sweeper_config) = config.sweeper.clone() {
        let sweeper = Arc::new(CacheSweeper::new(store.clone(), sweeper_config));
        background.push(sweeper.spawn(shutdown.clone()));
    }

    // Start admin server
    let admin_state = Arc::new(AdminState::new());
    let admin_listener = TcpListener::bind(config.admin_addr)
        .await
        .with_context(|| format!("Failed to bind admin server on {}", config.admin_addr))?;
    let admin = tokio::spawn(run_admin_server(
        admin_listener,
        admin_state.clone(),
        shutdown.clone(),
    ));

    // Start media server
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind media server on {}", config.listen_addr))?;
    let media = tokio::spawn(run_media_server(listener, router, shutdown.clone()));
    admin_state.set_ready(true);

    shutdown_signal().await;
    info!("Shutdown signal received");
    admin_state.set_ready(false);
    shutdown.cancel();

    for (name, server) in [("media", media), ("admin", admin)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
        }
    }
    for task in background {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Shutdown
// =============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
