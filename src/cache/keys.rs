//! Cache key definitions.
//!
//! Defines `RequestDescriptor`, the transport-neutral view of an inbound
//! request, and `CacheKeyPolicy`, which decides whether a request is cacheable
//! and under which `CacheKey`.

use std::fmt;

use axum::extract::MatchedPath;
use axum::http::{Method, Request};

/// Identity of a cacheable request.
///
/// Indexes both the in-flight table and the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What the cache needs to know about an inbound request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    url: Option<String>,
    operation: String,
}

impl RequestDescriptor {
    /// Create a descriptor. The operation id defaults to the URL.
    pub fn new(method: Method, url: Option<String>) -> Self {
        let operation = url.clone().unwrap_or_else(|| method.to_string());
        Self {
            method,
            url,
            operation,
        }
    }

    /// Override the operation id used to label hit counters.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Describe an HTTP request.
    ///
    /// The URL is the path plus query exactly as received. The operation id is
    /// the matched route pattern when the router exposes one, otherwise the
    /// request path.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let url = request
            .uri()
            .path_and_query()
            .map(|path_and_query| path_and_query.as_str().to_string());

        let operation = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());

        Self {
            method: request.method().clone(),
            url,
            operation,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

/// Decides which requests are cacheable.
///
/// Implementations must be pure: the same descriptor always maps to the same
/// key, and deriving a key has no side effects.
pub trait CacheKeyPolicy: Send + Sync {
    fn derive_key(&self, request: &RequestDescriptor) -> Option<CacheKey>;
}

/// Caches only the designated read-only method, keyed by URL.
#[derive(Debug, Clone)]
pub struct ReadOnlyPolicy {
    method: Method,
}

impl ReadOnlyPolicy {
    pub fn new(method: Method) -> Self {
        Self { method }
    }
}

impl Default for ReadOnlyPolicy {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl CacheKeyPolicy for ReadOnlyPolicy {
    fn derive_key(&self, request: &RequestDescriptor) -> Option<CacheKey> {
        if *request.method() != self.method {
            return None;
        }

        request
            .url()
            .filter(|url| !url.is_empty())
            .map(CacheKey::new)
    }
}
