//! Forwarding of permitted requests to the backend.

use std::time::Duration;

use axum::{body::Body, response::Response};
use http::{HeaderMap, HeaderName, header};
use tokio::time::Instant;

use crate::{
    config::BackendConfig,
    observability::metrics,
    pipeline::{PepError, RequestContext},
};

/// Connection-scoped headers that never cross the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Relays requests to the protected backend and streams the answer back.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, config: &BackendConfig) -> Self {
        Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
        }
    }

    /// Backend URL for an inbound path and query.
    pub fn target_url(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{path_and_query}", self.base_url)
        } else {
            format!("{}/{path_and_query}", self.base_url)
        }
    }

    /// Send the request to the backend.
    ///
    /// Method, path, query and body go out unchanged. The timeout covers the
    /// backend's response headers; the body is streamed to the client as it
    /// arrives. The backend's status is passed through, including 4xx and 5xx.
    pub async fn forward(&self, ctx: &RequestContext) -> Result<Response, PepError> {
        let request = &ctx.request;
        let url = self.target_url(request.path_and_query());
        let headers = outbound_headers(&request.headers, &ctx.consumed_headers);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let start = Instant::now();
        let sent = tokio::time::timeout(self.timeout, builder.send()).await;
        let elapsed = start.elapsed().as_secs_f64();

        let upstream = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                metrics::record_upstream_call("backend", "transport_error", elapsed);
                return Err(PepError::BackendUnavailable(format!("{url}: {e}")));
            }
            Err(_) => {
                metrics::record_upstream_call("backend", "timeout", elapsed);
                return Err(PepError::BackendUnavailable(format!(
                    "{url}: no response within {}ms",
                    self.timeout.as_millis()
                )));
            }
        };
        metrics::record_upstream_call("backend", "success", elapsed);

        let status = upstream.status();
        tracing::debug!(
            method = %request.method,
            url = %url,
            status = status.as_u16(),
            "Forwarded request"
        );

        let response_headers = strip_hop_by_hop(upstream.headers().clone());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Client headers minus hop-by-hop headers, headers the proxy consumed, and
/// anything the HTTP client recomputes for the new connection.
fn outbound_headers(inbound: &HeaderMap, consumed: &[HeaderName]) -> HeaderMap {
    let mut headers = strip_hop_by_hop(inbound.clone());
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    for name in consumed {
        headers.remove(name);
    }
    headers
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    // Headers named in `Connection` are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in &listed {
        headers.remove(name);
    }
    headers
}
