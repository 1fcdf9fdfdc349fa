//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects shared by every component and the
//! abstractions (ports) over the two external capabilities the cache relies
//! on: fetching remote bytes and persisting last-access timestamps.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │            Fetcher        │      AccessLedger        │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  HttpFetcher │ RedisLedger │ InMemoryLedger │ Stub   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};

use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// One of the fixed external media hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Rule34,
    Danbooru,
    Realbooru,
}

impl Origin {
    /// All supported origins, in sweep order.
    pub const ALL: [Origin; 3] = [Origin::Rule34, Origin::Danbooru, Origin::Realbooru];

    /// Path segment naming this origin.
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Rule34 => "rule34",
            Origin::Danbooru => "danbooru",
            Origin::Realbooru => "realbooru",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rule34" => Ok(Origin::Rule34),
            "danbooru" => Ok(Origin::Danbooru),
            "realbooru" => Ok(Origin::Realbooru),
            _ => Err(()),
        }
    }
}

/// Logical identity of a cacheable asset.
///
/// The slash-joined form `origin/dir.../filename` is used as the lock key,
/// the path below the media root and the ledger key. The origin is always
/// the leading segment, so identical directory/filename pairs under
/// different origins never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    origin: Origin,
    directory: Vec<String>,
    filename: String,
}

impl ResourceKey {
    pub fn new(origin: Origin, directory: Vec<String>, filename: impl Into<String>) -> Self {
        Self {
            origin,
            directory,
            filename: filename.into(),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn directory_segments(&self) -> &[String] {
        &self.directory
    }

    /// Directory segments joined with `/`.
    pub fn directory(&self) -> String {
        self.directory.join("/")
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Path of the cached file relative to the media root.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(self.origin.as_str());
        for segment in &self.directory {
            path.push(segment);
        }
        path.push(&self.filename);
        path
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.origin)?;
        for segment in &self.directory {
            write!(f, "/{}", segment)?;
        }
        write!(f, "/{}", self.filename)
    }
}

// =============================================================================
// Fetcher Port
// =============================================================================

/// Outbound GET request description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Add an extra request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Host part of the URL, used in log lines instead of the full URL.
    pub fn host(&self) -> &str {
        host_of(&self.url)
    }
}

/// Host component of a URL (`scheme://host/...`), or `"unknown"`.
pub fn host_of(url: &str) -> &str {
    url.split('/')
        .nth(2)
        .filter(|host| !host.is_empty())
        .unwrap_or("unknown")
}

/// Upstream body delivered chunk by chunk. A transport failure part way
/// through arrives as an `Err` item.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// A body made of a single chunk.
pub fn single_chunk(content: impl Into<Bytes>) -> BodyStream {
    stream::once(futures::future::ready(Ok(content.into()))).boxed()
}

/// Upstream response with its body not yet read.
pub struct FetchedBody {
    pub status: u16,
    pub body: BodyStream,
}

impl FetchedBody {
    pub fn new(status: u16, body: BodyStream) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body into memory.
    pub async fn into_bytes(self) -> Result<Bytes> {
        let buffer = self
            .body
            .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }
}

impl fmt::Debug for FetchedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedBody")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Port for fetching remote bytes.
///
/// Implementations own their connect/total timeouts, user agent and
/// redirect policy. Transport failures and timeouts before the status line
/// are `Err`; any HTTP status, successful or not, is returned in
/// [`FetchedBody`] with the body left for the caller to stream.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedBody>;

    /// Like [`Fetcher::fetch`], but a non-success status is an
    /// [`Error::UpstreamStatus`].
    async fn fetch_ok(&self, request: &FetchRequest) -> Result<FetchedBody> {
        let body = self.fetch(request).await?;
        if body.is_success() {
            Ok(body)
        } else {
            Err(Error::UpstreamStatus {
                host: request.host().to_string(),
                status: body.status,
            })
        }
    }
}

// =============================================================================
// Ledger Port
// =============================================================================

/// Port for the last-access ledger.
///
/// Every write is an unconditional overwrite (last writer wins).
#[async_trait]
pub trait AccessLedger: Send + Sync {
    /// Last access time for a key, `None` if never recorded.
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Overwrite the last access time for a key.
    async fn set(&self, key: &str, at: DateTime<Utc>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_round_trips_through_str() {
        for origin in Origin::ALL {
            assert_eq!(origin.as_str().parse::<Origin>(), Ok(origin));
        }
        assert!("gelbooru".parse::<Origin>().is_err());
    }

    #[test]
    fn test_resource_key_forms() {
        let key = ResourceKey::new(
            Origin::Danbooru,
            vec!["ab".into(), "cd".into()],
            "abcdef.webm",
        );
        assert_eq!(key.to_string(), "danbooru/ab/cd/abcdef.webm");
        assert_eq!(key.directory(), "ab/cd");
        assert_eq!(
            key.relative_path(),
            PathBuf::from("danbooru").join("ab").join("cd").join("abcdef.webm")
        );
    }

    #[test]
    fn test_keys_differ_across_origins() {
        let a = ResourceKey::new(Origin::Danbooru, vec!["ab".into(), "cd".into()], "x.mp4");
        let b = ResourceKey::new(Origin::Realbooru, vec!["ab".into(), "cd".into()], "x.mp4");
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://cdn.donmai.us/original/a/b/c.mp4"), "cdn.donmai.us");
        assert_eq!(host_of("not a url"), "unknown");
    }

    #[test]
    fn test_fetched_body_success_range() {
        let ok = FetchedBody::new(204, single_chunk(Bytes::new()));
        let redirect = FetchedBody::new(302, single_chunk(Bytes::new()));
        assert!(ok.is_success());
        assert!(!redirect.is_success());
    }

    #[tokio::test]
    async fn test_into_bytes_joins_chunks_in_order() {
        let chunks = vec![Ok(Bytes::from("ab")), Ok(Bytes::from("cd")), Ok(Bytes::from("e"))];
        let body = FetchedBody::new(200, stream::iter(chunks).boxed());
        assert_eq!(body.into_bytes().await.unwrap(), "abcde");
    }

    #[tokio::test]
    async fn test_into_bytes_surfaces_mid_body_failure() {
        let chunks = vec![
            Ok(Bytes::from("ab")),
            Err(Error::FetchTimeout { host: "cdn.donmai.us".into() }),
        ];
        let body = FetchedBody::new(200, stream::iter(chunks).boxed());
        assert!(body.into_bytes().await.unwrap_err().is_fetch_failure());
    }
}
