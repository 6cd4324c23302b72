//! Forwarding handler for the upstream origin.

use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use reqwest::{Client, redirect::Policy};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::config::UpstreamSettings;

const MAX_FORWARDED_BODY_BYTES: usize = 10 * 1024 * 1024;

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to read request body: {0}")]
    RequestBody(String),
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl UpstreamError {
    fn status(&self) -> StatusCode {
        match self {
            Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::Url(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(
            target = "roundcache::upstream",
            status = status.as_u16(),
            error = %self,
            "forwarding failed"
        );
        (status, status.canonical_reason().unwrap_or("upstream error")).into_response()
    }
}

/// Client bound to a single origin.
#[derive(Clone)]
pub struct Upstream {
    client: Client,
    base_url: Url,
}

impl Upstream {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .redirect(Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path_and_query` below the configured base, keeping any base path prefix.
    fn target(&self, path_and_query: &str) -> Result<Url, UpstreamError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}{path_and_query}"))?)
    }
}

/// Fallback handler relaying every request to the origin.
pub async fn forward(
    State(upstream): State<Upstream>,
    request: Request<Body>,
) -> Result<Response, UpstreamError> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let target = upstream.target(path_and_query)?;

    let body = to_bytes(body, MAX_FORWARDED_BODY_BYTES)
        .await
        .map_err(|err| UpstreamError::RequestBody(err.to_string()))?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let origin_response = upstream
        .client
        .request(parts.method, target)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = origin_response.status();
    let mut response_headers = origin_response.headers().clone();
    strip_hop_by_hop(&mut response_headers);
    response_headers.remove(header::CONTENT_LENGTH);
    let bytes = origin_response.bytes().await?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
