//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │              Fetcher       │       AccessLedger             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │  HttpFetcher │ RedisLedger │ InMemoryLedger │ StubFetcher  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use booru_cdn::adapters::{FetcherConfig, HttpFetcher, RedisLedger};
//! use booru_cdn::domain::ports::{AccessLedger, FetchRequest, Fetcher};
//!
//! let fetcher = HttpFetcher::new(FetcherConfig::default())?;
//! let body = fetcher.fetch(&FetchRequest::new(url)).await?;
//!
//! let ledger = RedisLedger::connect("localhost", 6379).await?;
//! ledger.set("rule34/12345/abc123.mp4", chrono::Utc::now()).await?;
//! ```

mod http_fetcher;
mod memory;
mod redis_ledger;

pub use http_fetcher::{FetcherConfig, HttpFetcher, DEFAULT_USER_AGENT};
pub use memory::{InMemoryLedger, StubFetcher};
pub use redis_ledger::RedisLedger;
