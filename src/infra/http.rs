//! Router assembly and serving.

use std::{future::IntoFuture, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
};
use tokio::{net::TcpListener, sync::Notify, time::Instant};
use tracing::{error, info, warn};

use crate::cache::{CacheState, response_cache_layer};

use super::{
    error::InfraError,
    upstream::{Upstream, forward},
};

/// Build the proxy router: every request falls through to the origin.
pub fn build_router(cache: CacheState, upstream: Upstream) -> Router {
    let proxied = Router::new().fallback(forward).with_state(upstream);

    let proxied = if cache.config.enabled {
        proxied.layer(middleware::from_fn_with_state(cache, response_cache_layer))
    } else {
        proxied
    };

    proxied.layer(middleware::from_fn(log_responses))
}

async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    if status.is_server_error() {
        error!(
            target = "roundcache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = elapsed_ms,
            "request failed",
        );
    } else if status.is_client_error() {
        warn!(
            target = "roundcache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = elapsed_ms,
            "request rejected",
        );
    }

    response
}

/// Serve `router` until Ctrl-C, then give in-flight requests `grace` to finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    grace: Duration,
) -> Result<(), InfraError> {
    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { signal.notified().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result.map_err(InfraError::from),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!(grace_seconds = grace.as_secs(), "shutdown requested");
            shutdown.notify_one();
        }
    }

    match tokio::time::timeout(grace, server).await {
        Ok(result) => result.map_err(InfraError::from),
        Err(_) => {
            warn!(
                grace_seconds = grace.as_secs(),
                "graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    }
}
