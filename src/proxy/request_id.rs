//! Request ID middleware for request correlation.
//!
//! Generates or propagates a unique request ID for each request, enabling
//! log correlation across the proxy and its upstreams.

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

/// Header name for the request ID.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Longest client-supplied ID that is accepted as-is.
const MAX_INBOUND_ID_LEN: usize = 128;

/// Extension containing the request ID for the current request.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Take the client's `X-Request-Id` if it is usable, otherwise generate one.
fn inbound_or_new(req: &Request) -> RequestId {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.len() <= MAX_INBOUND_ID_LEN)
        .map(|s| RequestId(s.to_string()))
        .unwrap_or_default()
}

/// Middleware that adds a request ID to each request.
///
/// The ID is stored as a request extension for the handler and recorded on a
/// span wrapping the rest of the request. Responses always carry it back in
/// `X-Request-Id`.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = inbound_or_new(&req);
    req.extensions_mut().insert(request_id.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    let mut response = next.run(req).instrument(span).await;

    if !response.headers().contains_key(REQUEST_ID_HEADER)
        && let Ok(value) = request_id.0.parse()
    {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}
