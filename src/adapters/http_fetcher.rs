//! HTTP Fetcher Adapter
//!
//! Implements the `Fetcher` port with `reqwest`. The body is handed back as
//! the connection delivers it, never buffered whole. Errors never carry the
//! request URL, only the upstream host.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::domain::ports::{FetchRequest, FetchedBody, Fetcher};
use crate::error::{Error, Result};

/// User agent sent to upstream hosts unless configured otherwise.
pub const DEFAULT_USER_AGENT: &str = "booru-cdn (+https://github.com/Aninoss/booru-cdn)";

/// Configuration for one outbound client
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Time allowed to establish the connection
    pub connect_timeout: Duration,

    /// Time allowed for the whole exchange, body included
    pub timeout: Duration,

    /// Follow 3xx responses instead of returning them
    pub follow_redirects: bool,

    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// `reqwest`-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let redirect = if config.follow_redirects {
            Policy::default()
        } else {
            Policy::none()
        };

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .redirect(redirect)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }
}

/// Map a transport error, dropping the URL it carries.
fn transport_error(host: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::FetchTimeout {
            host: host.to_string(),
        }
    } else {
        Error::Fetch {
            host: host.to_string(),
            source: e.without_url(),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(host = %request.host()))]
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedBody> {
        let host = request.host();

        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(host, e))?;
        let status = response.status().as_u16();
        debug!(status, length = ?response.content_length(), "Upstream responded");

        let host = host.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| transport_error(&host, e)))
            .boxed();
        Ok(FetchedBody::new(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP/1.1 response with a `len` byte body, written in 64 KiB
    /// slices, and return the URL to fetch.
    async fn serve_body(len: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                len
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            let slice = vec![7u8; 64 * 1024];
            let mut remaining = len;
            while remaining > 0 {
                let n = remaining.min(slice.len());
                socket.write_all(&slice[..n]).await.unwrap();
                remaining -= n;
            }
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/images/1/large.mp4", addr)
    }

    #[test]
    fn test_default_config() {
        let config = FetcherConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.follow_redirects);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_client_builds_with_either_redirect_policy() {
        for follow_redirects in [true, false] {
            let fetcher = HttpFetcher::new(FetcherConfig {
                follow_redirects,
                ..Default::default()
            })
            .unwrap();
            assert_eq!(fetcher.config().follow_redirects, follow_redirects);
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_fetch_failure_without_url() {
        let fetcher = HttpFetcher::new(FetcherConfig {
            connect_timeout: Duration::from_millis(200),
            timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();
        // Port 1 on loopback refuses connections.
        let request = FetchRequest::new("http://127.0.0.1:1/images/1/secret-token.mp4");

        let err = fetcher.fetch(&request).await.unwrap_err();
        assert!(err.is_fetch_failure());
        assert!(!err.to_string().contains("secret-token"));
    }

    #[tokio::test]
    async fn test_large_body_arrives_in_chunks() {
        let len = 4 * 1024 * 1024;
        let url = serve_body(len).await;
        let fetcher = HttpFetcher::new(FetcherConfig::default()).unwrap();

        let response = fetcher.fetch(&FetchRequest::new(url)).await.unwrap();
        assert_eq!(response.status, 200);

        let mut body = response.body;
        let mut chunks = 0;
        let mut total = 0;
        let mut largest = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.unwrap();
            chunks += 1;
            total += chunk.len();
            largest = largest.max(chunk.len());
        }
        assert_eq!(total, len);
        assert!(chunks > 1);
        assert!(largest < len);
    }
}
