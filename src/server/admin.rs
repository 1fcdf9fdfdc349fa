//! Admin endpoints: Prometheus exposition and health checks.

use std::sync::atomic::{AtomicBool, Ordering};

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use tracing::error;

use super::router::{full, HttpResponse};

/// Readiness flag flipped once the media listener is up.
#[derive(Debug, Default)]
pub struct AdminState {
    ready: AtomicBool,
}

impl AdminState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

pub fn handle<B>(state: &AdminState, req: &Request<B>) -> HttpResponse {
    match req.uri().path() {
        "/metrics" => match crate::metrics::gather() {
            Ok(buffer) => {
                let mut response = Response::new(full(buffer));
                if let Ok(content_type) = HeaderValue::from_str(&crate::metrics::content_type()) {
                    response.headers_mut().insert(CONTENT_TYPE, content_type);
                }
                response
            }
            Err(e) => {
                error!(error = %e, "Failed to render metrics");
                status(StatusCode::INTERNAL_SERVER_ERROR, "")
            }
        },
        "/healthz" | "/livez" => status(StatusCode::OK, "ok"),
        "/readyz" if state.is_ready() => status(StatusCode::OK, "ok"),
        "/readyz" => status(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => status(StatusCode::NOT_FOUND, "not found"),
    }
}

fn status(code: StatusCode, body: &'static str) -> HttpResponse {
    let mut response = Response::new(full(body));
    *response.status_mut() = code;
    response
}
