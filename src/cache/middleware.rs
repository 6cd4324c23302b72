//! Response cache middleware.
//!
//! Runs cacheable requests through the coalescing cache, with the rest of the
//! router as the computation. Skips event-stream requests and anything the key
//! policy rejects.
//!
//! Cacheable requests are forwarded without `Accept-Encoding`, so one stored
//! body suits every client. Responses that belong to a single client (cookies,
//! `Vary` on request headers) are never shared: waiters that joined such a
//! computation run the downstream themselves.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::{
    CacheConfig, CoalescingCache, MemoryStore, RoundClock,
    keys::RequestDescriptor,
};

/// Coalescing cache specialised to buffered HTTP responses.
pub type ResponseCache = CoalescingCache<CachedResponse, UncachedResponse>;

/// Outcome of a computation whose response must not be stored.
#[derive(Debug, Clone)]
pub enum UncachedResponse {
    /// Handed to every concurrent waiter, never stored.
    Shared(CachedResponse),
    /// Belongs to the client that triggered it; waiters compute their own.
    Private,
}

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub cache: Arc<ResponseCache>,
}

impl CacheState {
    pub fn new(config: CacheConfig, cache: Arc<ResponseCache>) -> Self {
        Self { config, cache }
    }

    /// Build a cache backed by a `MemoryStore` sized from `config`.
    pub fn in_memory(config: CacheConfig, clock: Arc<dyn RoundClock>) -> Self {
        let store = Arc::new(MemoryStore::<CachedResponse>::new(
            config.max_entries_non_zero(),
        ));
        let cache = Arc::new(ResponseCache::new(store, clock));
        Self::new(config, cache)
    }
}

/// Buffered HTTP response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let stored_headers = headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Self {
            status,
            headers: stored_headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    fn header(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value)
    }

    /// True when the response carries state tied to the requesting client.
    fn is_private(&self) -> bool {
        if self.header(&header::SET_COOKIE).is_some() {
            return true;
        }

        self.headers
            .iter()
            .filter(|(name, _)| *name == header::VARY)
            .any(|(_, value)| varies_on_client(value))
    }

    fn internal_error() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            &HeaderMap::new(),
            Bytes::new(),
        )
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            headers.append(name, value);
        }

        response
    }
}

/// Middleware for coalesced, round-aligned response caching.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<CacheState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.enabled {
        return next.run(request).await;
    }

    if accepts_event_stream(request.headers()) {
        debug!(cache = "response", outcome = "bypass", "event stream request");
        return next.run(request).await;
    }

    let descriptor = RequestDescriptor::from_request(&request);
    if !state.cache.is_cacheable(&descriptor) {
        return next.run(request).await;
    }

    request.headers_mut().remove(header::ACCEPT_ENCODING);

    let max_body_bytes = state.config.max_body_bytes;
    // Left in place when another request leads the computation.
    let mut downstream = Some((request, next));
    let mut own_response = None;

    let outcome = {
        let downstream = &mut downstream;
        let own_response = &mut own_response;
        state
            .cache
            .handle(&descriptor, move || async move {
                let Some((request, next)) = downstream.take() else {
                    return Err(UncachedResponse::Shared(CachedResponse::internal_error()));
                };
                let response = next.run(request).await;
                match capture_response(response, max_body_bytes).await {
                    Ok(cached) => Ok(cached),
                    Err(cached) if cached.is_private() => {
                        *own_response = Some(cached);
                        Err(UncachedResponse::Private)
                    }
                    Err(cached) => Err(UncachedResponse::Shared(cached)),
                }
            })
            .await
    };

    match outcome {
        Ok(cached) | Err(UncachedResponse::Shared(cached)) => cached.into_response(),
        Err(UncachedResponse::Private) => match (own_response, downstream) {
            (Some(cached), _) => cached.into_response(),
            (None, Some((request, next))) => {
                debug!(
                    cache = "response",
                    outcome = "bypass",
                    "in-flight response was client specific"
                );
                next.run(request).await
            }
            (None, None) => CachedResponse::internal_error().into_response(),
        },
    }
}

/// Buffer a downstream response and classify it as storable or not.
async fn capture_response(
    response: Response,
    max_body_bytes: usize,
) -> Result<CachedResponse, CachedResponse> {
    let (parts, body) = response.into_parts();
    let bytes = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            warn!(cache = "response", error = %error, "failed to buffer response body");
            return Err(CachedResponse::internal_error());
        }
    };

    let cached = CachedResponse::new(parts.status, &parts.headers, bytes);
    if should_store_response(&cached, max_body_bytes) {
        Ok(cached)
    } else {
        Err(cached)
    }
}

fn should_store_response(response: &CachedResponse, max_body_bytes: usize) -> bool {
    if !response.status.is_success() {
        return false;
    }

    if response.is_private() {
        return false;
    }

    if response
        .header(&header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    response.body.len() <= max_body_bytes
}

/// `Accept-Encoding` is stripped from cacheable requests, so it is the only
/// request header a stored response may vary on.
fn varies_on_client(value: &HeaderValue) -> bool {
    let Ok(value) = value.to_str() else {
        return true;
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .any(|name| !name.eq_ignore_ascii_case("accept-encoding"))
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("text/event-stream"))
}
