use bytes::Bytes;
use http::{HeaderMap, HeaderName, Method, Uri, Version};

use crate::{
    action::{Action, ExtractError},
    decision::Decision,
    identity::Identity,
};

/// Inbound request as received, with the body fully buffered.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawRequest {
    /// Split an axum request whose body has already been collected.
    pub fn from_parts(parts: http::request::Parts, body: Bytes) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
        }
    }

    /// Path plus query string, as sent by the client.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}

/// Per-request state threaded through the pipeline.
///
/// Created when a request arrives and owned by the task handling it. Stages
/// fill in the action, identity and decision as the request progresses.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub request: RawRequest,
    pub action: Option<Action>,
    /// Extraction failure, held until the token has been checked.
    pub extraction_error: Option<ExtractError>,
    pub token: Option<String>,
    pub identity: Option<Identity>,
    pub decision: Option<Decision>,
    /// Headers read by the proxy that must not reach the backend.
    pub consumed_headers: Vec<HeaderName>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, request: RawRequest) -> Self {
        Self {
            request_id: request_id.into(),
            request,
            action: None,
            extraction_error: None,
            token: None,
            identity: None,
            decision: None,
            consumed_headers: Vec::new(),
        }
    }

    /// Mark a header as internal to the proxy.
    pub fn consume_header(&mut self, name: HeaderName) {
        if !self.consumed_headers.contains(&name) {
            self.consumed_headers.push(name);
        }
    }

    /// True only when a decision exists and it is a permit.
    pub fn is_permitted(&self) -> bool {
        self.decision.as_ref().is_some_and(Decision::is_permit)
    }
}
