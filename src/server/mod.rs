//! HTTP Servers
//!
//! Two HTTP/1 listeners: the media server answering the routes of
//! [`MediaRouter`], and the admin server exposing metrics and health
//! checks. Each accepted connection is served on its own task; both accept
//! loops stop when the shutdown token is cancelled.

pub mod admin;
pub mod player;
pub mod router;

use std::convert::Infallible;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

pub use admin::AdminState;
pub use router::{HttpResponse, MediaRouter, ResponseBody, ORIGINAL_URI_HEADER};

/// Serve media requests on `listener` until `shutdown` is cancelled.
pub async fn run_media_server(
    listener: TcpListener,
    router: MediaRouter,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Media server listening on {}", local_addr(&listener));

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Media server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let router = router.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let router = router.clone();
                async move { Ok::<_, Infallible>(router.handle(req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, "Media server connection error: {}", e);
            }
        });
    }

    info!("Media server stopped");
    Ok(())
}

/// Serve `/metrics`, `/healthz`, `/livez` and `/readyz` until `shutdown`
/// is cancelled.
pub async fn run_admin_server(
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Admin server listening on {}", local_addr(&listener));

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Admin server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = admin::handle(&state, &req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Admin server connection error: {}", e);
            }
        });
    }

    Ok(())
}

fn local_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
