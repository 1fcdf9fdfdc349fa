//! Proxy Downloader
//!
//! Privileged pass-through download of arbitrary upstream files into
//! `<proxy_root>/<id><ext>`, guarded by a shared secret. Downloads are
//! single-flight per target file and never re-fetched once present.
//!
//! Unlike media downloads, the upstream status is returned to the caller
//! instead of being swallowed, and transport failures surface as errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::domain::{FetchRequest, Fetcher};
use crate::error::Result;

use super::locks::KeyedLocks;
use super::store::{write_atomically, PARTIAL_DIR};
use super::validator::Rejection;

/// Result of a proxy download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// Downloaded and stored by this call
    Stored(PathBuf),
    /// Already on disk; nothing fetched
    AlreadyPresent(PathBuf),
    /// Upstream answered with this non-success status; nothing stored
    Upstream(u16),
}

/// A validated proxy download target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    url: String,
    file_name: String,
}

impl ProxyTarget {
    /// Validate a decoded upstream URL and target id. The id must be
    /// alphanumeric; the URL must end in `.<alphanumeric>` (query ignored).
    pub fn new(url: &str, id: &str) -> std::result::Result<Self, Rejection> {
        if id.is_empty() || !id.chars().all(char::is_alphanumeric) {
            return Err(Rejection::InvalidFilename);
        }
        let ext = url_extension(url).ok_or(Rejection::InvalidFilename)?;
        Ok(Self {
            url: url.to_string(),
            file_name: format!("{}.{}", id, ext),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `<id>.<ext>`
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// Extension after the last `.` of the URL without its query.
fn url_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let (_, ext) = path.rsplit_once('.')?;
    (!ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(ext)
}

/// Shared-secret pass-through downloader.
pub struct ProxyDownloader {
    root: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    locks: Arc<KeyedLocks>,
    referer: String,
    secret: Option<String>,
}

impl ProxyDownloader {
    pub fn new(
        root: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
        locks: Arc<KeyedLocks>,
        referer: impl Into<String>,
        secret: Option<String>,
    ) -> Self {
        Self {
            root: root.into(),
            fetcher,
            locks,
            referer: referer.into(),
            secret,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `presented` matches the configured secret. Always false when
    /// no secret is configured.
    pub fn authorize(&self, presented: &str) -> bool {
        match &self.secret {
            Some(secret) => constant_time_eq(secret.as_bytes(), presented.as_bytes()),
            None => false,
        }
    }

    /// Fetch the target unless it is already stored.
    #[instrument(skip(self, target), fields(file = %target.file_name()))]
    pub async fn download(&self, target: &ProxyTarget) -> Result<ProxyOutcome> {
        let dest = self.root.join(target.file_name());
        let _guard = self
            .locks
            .lock(&format!("proxy/{}", target.file_name()))
            .await;

        if tokio::fs::try_exists(&dest).await? {
            debug!("Proxy file already present");
            return Ok(ProxyOutcome::AlreadyPresent(dest));
        }

        let request = FetchRequest::new(target.url()).with_header("Referer", self.referer.as_str());
        info!(host = %request.host(), "Downloading proxy file");

        let body = self.fetcher.fetch(&request).await?;
        if !body.is_success() {
            warn!(host = %request.host(), status = body.status, "Proxy download rejected by upstream");
            return Ok(ProxyOutcome::Upstream(body.status));
        }

        let bytes = write_atomically(&self.root.join(PARTIAL_DIR), &dest, body.body).await?;
        info!(bytes, "Proxy download complete");
        Ok(ProxyOutcome::Stored(dest))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StubFetcher;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tempfile::TempDir;

    const URL: &str = "https://i.pximg.net/img-original/img/2024/01/01/00/00/00/1234_p0.png";

    fn downloader(dir: &TempDir, fetcher: Arc<StubFetcher>) -> ProxyDownloader {
        ProxyDownloader::new(
            dir.path(),
            fetcher,
            Arc::new(KeyedLocks::default()),
            "https://app-api.pixiv.net",
            Some("s3cret".into()),
        )
    }

    #[test]
    fn test_target_validation() {
        let target = ProxyTarget::new(URL, "1234p0").unwrap();
        assert_eq!(target.file_name(), "1234p0.png");

        let target = ProxyTarget::new("https://host/a/b.jpg?size=large", "9").unwrap();
        assert_eq!(target.file_name(), "9.jpg");

        assert_eq!(ProxyTarget::new(URL, ""), Err(Rejection::InvalidFilename));
        assert_eq!(ProxyTarget::new(URL, "../etc"), Err(Rejection::InvalidFilename));
        assert_eq!(
            ProxyTarget::new("https://host.com/noext", "1"),
            Err(Rejection::InvalidFilename)
        );
        assert_eq!(
            ProxyTarget::new("https://host/a.tar/", "1"),
            Err(Rejection::InvalidFilename)
        );
    }

    #[test]
    fn test_authorize() {
        let dir = TempDir::new().unwrap();
        let proxy = downloader(&dir, Arc::new(StubFetcher::with_body(200, "")));
        assert!(proxy.authorize("s3cret"));
        assert!(!proxy.authorize("s3cre"));
        assert!(!proxy.authorize(""));

        let open = ProxyDownloader::new(
            dir.path(),
            Arc::new(StubFetcher::with_body(200, "")),
            Arc::new(KeyedLocks::default()),
            "",
            None,
        );
        assert!(!open.authorize(""));
    }

    #[tokio::test]
    async fn test_stores_once_with_referer() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(StubFetcher::with_body(200, "png-bytes"));
        let proxy = downloader(&dir, fetcher.clone());
        let target = ProxyTarget::new(URL, "1234").unwrap();

        let first = proxy.download(&target).await.unwrap();
        let second = proxy.download(&target).await.unwrap();

        let expected = dir.path().join("1234.png");
        assert_eq!(first, ProxyOutcome::Stored(expected.clone()));
        assert_eq!(second, ProxyOutcome::AlreadyPresent(expected.clone()));
        assert_eq!(std::fs::read(expected).unwrap(), b"png-bytes");
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(
            fetcher.requests()[0].headers,
            vec![("Referer".to_string(), "https://app-api.pixiv.net".to_string())]
        );
    }

    #[tokio::test]
    async fn test_upstream_status_is_passed_through() {
        let dir = TempDir::new().unwrap();
        let proxy = downloader(&dir, Arc::new(StubFetcher::with_body(403, "denied")));
        let target = ProxyTarget::new(URL, "1234").unwrap();

        assert_matches!(proxy.download(&target).await, Ok(ProxyOutcome::Upstream(403)));
        assert!(!dir.path().join("1234.png").exists());
    }

    #[tokio::test]
    async fn test_transport_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let proxy = downloader(&dir, Arc::new(StubFetcher::failing()));
        let target = ProxyTarget::new(URL, "1234").unwrap();

        assert_matches!(proxy.download(&target).await, Err(Error::FetchTimeout { .. }));
    }

    #[tokio::test]
    async fn test_truncated_body_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let proxy = downloader(&dir, Arc::new(StubFetcher::with_truncated_body("png")));
        let target = ProxyTarget::new(URL, "1234").unwrap();

        let err = proxy.download(&target).await.unwrap_err();
        assert!(err.is_fetch_failure());
        assert!(!dir.path().join("1234.png").exists());
    }

    #[tokio::test]
    async fn test_concurrent_downloads_share_one_fetch() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            StubFetcher::with_body(200, "png").with_delay(Duration::from_millis(30)),
        );
        let proxy = Arc::new(downloader(&dir, fetcher.clone()));
        let target = ProxyTarget::new(URL, "1234").unwrap();

        let outcomes = futures::future::join_all((0..6).map(|_| proxy.download(&target))).await;
        let stored = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(ProxyOutcome::Stored(_))))
            .count();
        assert_eq!(stored, 1);
        assert_eq!(fetcher.calls(), 1);
    }
}
