use axum::{
    extract::{Request, State},
    response::Response,
};
use http_body_util::LengthLimitError;
use tokio::time::Instant;

use super::{ProxyState, request_id::RequestId};
use crate::{
    observability::metrics,
    pipeline::{ChainOutcome, PepError, RawRequest, RequestContext},
};

/// Catch-all handler: buffer the body, then run the pipeline.
pub(super) async fn handle_request(State(state): State<ProxyState>, request: Request) -> Response {
    let start = Instant::now();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_default();
    let method = request.method().clone();

    let (parts, body) = request.into_parts();
    let response = match axum::body::to_bytes(body, state.body_limit).await {
        Ok(bytes) => {
            let raw = RawRequest::from_parts(parts, bytes);
            state
                .pipeline
                .execute(RequestContext::new(request_id.as_str(), raw))
                .await
        }
        Err(e) => {
            let inner = e.into_inner();
            let err = if exceeds_limit(&*inner) {
                PepError::PayloadTooLarge {
                    limit: state.body_limit,
                }
            } else {
                PepError::InvalidRequest(format!("Failed to read request body: {inner}"))
            };
            tracing::info!(error = %err, "Rejected request body");
            err.into_response_with_id(request_id.as_str())
        }
    };

    let outcome = response
        .extensions()
        .get::<ChainOutcome>()
        .map(|o| o.outcome.clone())
        .unwrap_or_else(|| "invalid_body".to_string());
    metrics::record_request(
        method.as_str(),
        response.status().as_u16(),
        &outcome,
        start.elapsed().as_secs_f64(),
    );

    response
}

fn exceeds_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}
