//! Media Router
//!
//! Maps inbound requests to the media components and formats responses.
//!
//! | Route                                      | Response                        |
//! |--------------------------------------------|---------------------------------|
//! | `/ping`                                    | `200 Pong!`                     |
//! | `/request` + `X-Original-URI`              | cache fill, `200` / `403`       |
//! | `/media/<origin>/<dir...>/<file>[?s=]`     | `307` or inline bytes           |
//! | `/player/<path>.<ext>?s=&w=&h=`            | HTML player page                |
//! | `/proxy_download/<url>/<id>/<secret>`      | shared-secret pass-through      |
//!
//! `/pixiv_download/` is accepted as an alias of `/proxy_download/`.
//! Internal failures are logged with full context and answered with an
//! empty `500`. Inline media is streamed from disk, never read whole.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use crate::config::ServeMode;
use crate::error::Result;
use crate::media::{
    parse, CacheOutcome, DownloadCoordinator, ParsedRequest, ProxyDownloader, ProxyOutcome,
    ProxyTarget, Rejection, ShardFilter,
};

use super::player::{self, PlayerError};

/// Header carrying the original request URI on `/request`.
pub const ORIGINAL_URI_HEADER: &str = "x-original-uri";

const MEDIA_PREFIX: &str = "/media/";
const PLAYER_PREFIX: &str = "/player";
const PROXY_PREFIXES: [&str; 2] = ["/proxy_download/", "/pixiv_download/"];

/// Body of every response: in-memory for small answers, a file stream for
/// inline media.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Response type of every route.
pub type HttpResponse = Response<ResponseBody>;

/// In-memory response body.
pub fn full(content: impl Into<Bytes>) -> ResponseBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Response body read from `file` as the connection drains it.
fn file_body(file: tokio::fs::File) -> ResponseBody {
    StreamBody::new(ReaderStream::new(file).map_ok(Frame::data)).boxed_unsync()
}

/// Request router shared by all connections.
#[derive(Clone)]
pub struct MediaRouter {
    mode: ServeMode,
    shard_filter: ShardFilter,
    coordinator: DownloadCoordinator,
    proxy: Arc<ProxyDownloader>,
}

impl MediaRouter {
    pub fn new(
        mode: ServeMode,
        shard_filter: ShardFilter,
        coordinator: DownloadCoordinator,
        proxy: Arc<ProxyDownloader>,
    ) -> Self {
        Self {
            mode,
            shard_filter,
            coordinator,
            proxy,
        }
    }

    pub fn mode(&self) -> ServeMode {
        self.mode
    }

    /// Answer one request. The body is never read.
    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse {
        let (parts, _) = req.into_parts();
        if parts.method != Method::GET && parts.method != Method::HEAD {
            return empty(StatusCode::NOT_FOUND);
        }
        let path = parts.uri.path();

        let (route, response) = if path == "/ping" {
            ("ping", text(StatusCode::OK, "Pong!"))
        } else if path == "/request" {
            let original = parts
                .headers
                .get(ORIGINAL_URI_HEADER)
                .and_then(|v| v.to_str().ok());
            ("request", self.request(original).await)
        } else if path.starts_with(MEDIA_PREFIX) {
            let raw = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or(path);
            ("media", self.media(raw).await)
        } else if let Some(rest) = path.strip_prefix(PLAYER_PREFIX) {
            ("player", self.player(rest, parts.uri.query()))
        } else if let Some(rest) = PROXY_PREFIXES
            .iter()
            .find_map(|prefix| path.strip_prefix(prefix))
        {
            ("proxy_download", self.proxy_download(rest).await)
        } else {
            ("unknown", empty(StatusCode::NOT_FOUND))
        };

        crate::metrics::record_request(route, response.status().as_str());
        response
    }

    /// Full flow for a path forwarded by the front proxy.
    async fn request(&self, original_uri: Option<&str>) -> HttpResponse {
        let Some(uri) = original_uri else {
            debug!("Request without original URI header");
            return empty(StatusCode::FORBIDDEN);
        };
        let parsed = match self.accept(uri) {
            Ok(parsed) => parsed,
            Err(rejection) => return forbidden(uri, rejection),
        };

        match self.fill(&parsed).await {
            Ok(_) => empty(StatusCode::OK),
            Err(e) => internal_error("request", parsed.key(), e),
        }
    }

    async fn media(&self, raw: &str) -> HttpResponse {
        let parsed = match self.accept(raw) {
            Ok(parsed) => parsed,
            Err(rejection) => return forbidden(raw, rejection),
        };

        match self.mode {
            ServeMode::Redirect => match HeaderValue::from_str(&parsed.source_url()) {
                Ok(location) => {
                    let mut response = empty(StatusCode::TEMPORARY_REDIRECT);
                    response.headers_mut().insert(LOCATION, location);
                    response
                }
                Err(e) => {
                    error!(key = %parsed.key(), error = %e, "Invalid redirect location");
                    empty(StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
            ServeMode::ServeInline => match self.fill(&parsed).await {
                Ok(CacheOutcome::Cached(path)) => match open_media(&path).await {
                    Ok((file, len)) => {
                        let mut response = Response::new(file_body(file));
                        let headers = response.headers_mut();
                        headers.insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static(content_type(parsed.filename())),
                        );
                        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                        response
                    }
                    // Swept between fill and open; the next request fetches again.
                    Err(e) => {
                        warn!(key = %parsed.key(), error = %e, "Cached media vanished before read");
                        empty(StatusCode::BAD_GATEWAY)
                    }
                },
                Ok(CacheOutcome::Missing) => empty(StatusCode::BAD_GATEWAY),
                Err(e) => internal_error("media", parsed.key(), e),
            },
        }
    }

    fn player(&self, path: &str, query: Option<&str>) -> HttpResponse {
        match player::render(path, query) {
            Ok(html) => {
                let mut response = Response::new(full(html));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
                response
            }
            Err(PlayerError::NotFound) => empty(StatusCode::NOT_FOUND),
            Err(PlayerError::BadQuery) => empty(StatusCode::BAD_REQUEST),
        }
    }

    async fn proxy_download(&self, rest: &str) -> HttpResponse {
        let parts: Vec<&str> = rest.split('/').collect();
        let [encoded_url, id, secret] = parts.as_slice() else {
            return empty(StatusCode::NOT_FOUND);
        };

        if !self.proxy.authorize(secret) {
            debug!(reason = %Rejection::Unauthorized, "Rejected proxy download");
            return empty(StatusCode::FORBIDDEN);
        }
        let Ok(url) = urlencoding::decode(encoded_url) else {
            return empty(StatusCode::FORBIDDEN);
        };
        let target = match ProxyTarget::new(&url, id) {
            Ok(target) => target,
            Err(rejection) => {
                debug!(reason = %rejection, "Rejected proxy download");
                return empty(StatusCode::FORBIDDEN);
            }
        };

        match self.proxy.download(&target).await {
            Ok(ProxyOutcome::Stored(_) | ProxyOutcome::AlreadyPresent(_)) => empty(StatusCode::OK),
            Ok(ProxyOutcome::Upstream(status)) => {
                empty(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
            }
            Err(e) if e.is_fetch_failure() => {
                warn!(file = target.file_name(), error = %e, "Proxy download failed");
                empty(StatusCode::BAD_GATEWAY)
            }
            Err(e) => {
                error!(file = target.file_name(), error = %e, "Proxy download error");
                empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Validate a raw path and check shard ownership.
    fn accept(&self, raw: &str) -> std::result::Result<ParsedRequest, Rejection> {
        let parsed = parse(raw)?;
        if !self.shard_filter.is_responsible(parsed.key()) {
            return Err(Rejection::NotResponsible);
        }
        Ok(parsed)
    }

    /// Ensure the resource is cached, then record the access.
    async fn fill(&self, parsed: &ParsedRequest) -> Result<CacheOutcome> {
        let outcome = self
            .coordinator
            .ensure_cached(parsed.key(), &parsed.source_url())
            .await?;
        self.coordinator.store().record_access(parsed.key()).await?;
        Ok(outcome)
    }
}

/// Open a cached file and read its length. An open handle keeps serving
/// the content even if the sweeper unlinks the path meanwhile.
async fn open_media(path: &std::path::Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

fn content_type(filename: &str) -> &'static str {
    match filename.rsplit_once('.').map(|(_, ext)| ext) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

fn empty(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn text(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut response = Response::new(full(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn forbidden(raw: &str, rejection: Rejection) -> HttpResponse {
    debug!(path = raw, reason = %rejection, "Rejected request");
    empty(StatusCode::FORBIDDEN)
}

fn internal_error(route: &str, key: &impl std::fmt::Display, e: crate::error::Error) -> HttpResponse {
    error!(route, key = %key, error = %e, "Request failed");
    empty(StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryLedger, StubFetcher};
    use crate::media::{CacheStore, KeyedLocks, ShardAssignment, ShardHashScope};
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        router: MediaRouter,
        fetcher: Arc<StubFetcher>,
        ledger: Arc<InMemoryLedger>,
    }

    fn harness(mode: ServeMode, shard_filter: ShardFilter, fetcher: StubFetcher) -> Harness {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(fetcher);
        let ledger = Arc::new(InMemoryLedger::new());
        let locks = Arc::new(KeyedLocks::default());
        let store = Arc::new(CacheStore::new(dir.path().join("media"), ledger.clone()));
        let coordinator = DownloadCoordinator::new(store, fetcher.clone(), locks.clone());
        let proxy = Arc::new(ProxyDownloader::new(
            dir.path().join("proxy"),
            fetcher.clone(),
            locks,
            "https://app-api.pixiv.net",
            Some("secret".into()),
        ));
        Harness {
            _dir: dir,
            router: MediaRouter::new(mode, shard_filter, coordinator, proxy),
            fetcher,
            ledger,
        }
    }

    fn get(uri: &str) -> Request<()> {
        Request::get(uri).body(()).unwrap()
    }

    fn forwarded(original: &str) -> Request<()> {
        Request::get("/request")
            .header("X-Original-URI", original)
            .body(())
            .unwrap()
    }

    async fn body(response: HttpResponse) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_ping() {
        let h = harness(ServeMode::Redirect, ShardFilter::disabled(), StubFetcher::failing());
        let response = h.router.handle(get("/ping")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "Pong!");
    }

    #[tokio::test]
    async fn test_request_fills_cache_and_records_access() {
        let h = harness(
            ServeMode::Redirect,
            ShardFilter::disabled(),
            StubFetcher::with_body(200, "video"),
        );

        let response = h.router.handle(forwarded("/media/rule34/12345/abc123.mp4")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(
            h.fetcher.requests()[0].url,
            "https://api-cdn-mp4.rule34.xxx/images/12345/abc123.mp4"
        );
        assert!(h.ledger.contains("rule34/12345/abc123.mp4"));
    }

    #[tokio::test]
    async fn test_request_without_header_is_forbidden() {
        let h = harness(ServeMode::Redirect, ShardFilter::disabled(), StubFetcher::failing());
        let response = h.router.handle(get("/request")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_download_failure_still_answers_ok() {
        let h = harness(ServeMode::Redirect, ShardFilter::disabled(), StubFetcher::failing());
        let response = h.router.handle(forwarded("/media/danbooru/ab/cd/abcdef.webm")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.ledger.contains("danbooru/ab/cd/abcdef.webm"));
    }

    #[tokio::test]
    async fn test_foreign_shard_is_forbidden_without_fetch() {
        // combined hash of ("12345", "abc123.mp4") mod 4 is 1
        let filter = ShardFilter::enabled(ShardAssignment::new(4, [0, 2, 3]), ShardHashScope::Legacy);
        let h = harness(ServeMode::Redirect, filter, StubFetcher::with_body(200, "video"));

        let response = h.router.handle(forwarded("/media/rule34/12345/abc123.mp4")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(h.fetcher.calls(), 0);
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_redirect_mode() {
        let h = harness(ServeMode::Redirect, ShardFilter::disabled(), StubFetcher::failing());
        let response = h
            .router
            .handle(get("/media/danbooru/ab/cd/abcdef.mp4?s=testbooru"))
            .await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[LOCATION],
            "https://testbooru.donmai.us/original/ab/cd/abcdef.mp4"
        );
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_inline_mode_serves_bytes() {
        let h = harness(
            ServeMode::ServeInline,
            ShardFilter::disabled(),
            StubFetcher::with_body(200, "webm-bytes"),
        );
        let response = h.router.handle(get("/media/realbooru/0a/1b/abc.webm")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/webm");
        assert_eq!(body(response).await, "webm-bytes");
    }

    #[tokio::test]
    async fn test_inline_mode_streams_large_files_from_disk() {
        let chunks: Vec<Bytes> = (0..16u8).map(|i| Bytes::from(vec![i; 64 * 1024])).collect();
        let h = harness(
            ServeMode::ServeInline,
            ShardFilter::disabled(),
            StubFetcher::with_chunks(200, chunks),
        );
        let response = h.router.handle(get("/media/rule34/12345/abc123.mp4")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "1048576");

        let mut body = response.into_body();
        let mut frames = 0;
        let mut total = 0;
        while let Some(frame) = body.frame().await {
            let data = frame.unwrap().into_data().unwrap();
            frames += 1;
            total += data.len();
        }
        assert_eq!(total, 1024 * 1024);
        assert!(frames > 1);
    }

    #[tokio::test]
    async fn test_inline_mode_download_failure_is_bad_gateway() {
        let h = harness(ServeMode::ServeInline, ShardFilter::disabled(), StubFetcher::failing());
        let response = h.router.handle(get("/media/realbooru/0a/1b/abc.webm")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_malformed_media_paths_are_forbidden() {
        let h = harness(ServeMode::Redirect, ShardFilter::disabled(), StubFetcher::failing());
        for uri in [
            "/media/rule34/12345/virus.exe",
            "/media/rule34/12345",
            "/media/gelbooru/1/a.mp4",
            "/media/rule34/12a45/abc.mp4",
            "/media/danbooru/ab/abcdef.mp4",
        ] {
            let response = h.router.handle(get(uri)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "uri = {}", uri);
        }
    }

    #[tokio::test]
    async fn test_player_routes() {
        let h = harness(ServeMode::Redirect, ShardFilter::disabled(), StubFetcher::failing());

        let response = h
            .router
            .handle(get("/player/rule34/12345/abc123.mp4?s=api-cdn-mp4&w=640&h=360"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let html = body(response).await;
        assert!(std::str::from_utf8(&html)
            .unwrap()
            .contains("/media/rule34/12345/abc123.mp4?s=api-cdn-mp4"));

        let response = h.router.handle(get("/player/rule34/12345/abc123.mp4")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = h.router.handle(get("/player/rule34/abc-123")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_download() {
        let h = harness(
            ServeMode::Redirect,
            ShardFilter::disabled(),
            StubFetcher::with_body(200, "png"),
        );
        let url = urlencoding::encode("https://i.pximg.net/img/1234_p0.png");

        let response = h
            .router
            .handle(get(&format!("/proxy_download/{}/1234/wrong", url)))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(h.fetcher.calls(), 0);

        let response = h
            .router
            .handle(get(&format!("/proxy_download/{}/1234/secret", url)))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.fetcher.requests()[0].url, "https://i.pximg.net/img/1234_p0.png");
    }

    #[tokio::test]
    async fn test_pixiv_download_is_an_alias() {
        let h = harness(
            ServeMode::Redirect,
            ShardFilter::disabled(),
            StubFetcher::with_body(200, "png"),
        );
        let url = urlencoding::encode("https://i.pximg.net/img/1234_p0.png");

        let response = h
            .router
            .handle(get(&format!("/pixiv_download/{}/1234/wrong", url)))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = h
            .router
            .handle(get(&format!("/pixiv_download/{}/1234/secret", url)))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_proxy_download_passes_upstream_status() {
        let h = harness(
            ServeMode::Redirect,
            ShardFilter::disabled(),
            StubFetcher::with_body(404, ""),
        );
        let url = urlencoding::encode("https://i.pximg.net/img/1234_p0.png");
        let response = h
            .router
            .handle(get(&format!("/proxy_download/{}/1234/secret", url)))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_routes_are_not_found() {
        let h = harness(ServeMode::Redirect, ShardFilter::disabled(), StubFetcher::failing());
        for uri in ["/", "/favicon.ico", "/proxy_download/a/b"] {
            let response = h.router.handle(get(uri)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri = {}", uri);
        }
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type("a.mp4"), "video/mp4");
        assert_eq!(content_type("a.avi"), "video/x-msvideo");
        assert_eq!(content_type("a"), "application/octet-stream");
    }
}
