use std::fmt;

use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{
    action::ExtractError,
    decision::DecisionError,
    identity::ValidationError,
    proxy::REQUEST_ID_HEADER,
};

/// Upstream services the proxy depends on before forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    IdentityProvider,
    Pdp,
}

impl Upstream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::IdentityProvider => "identity_provider",
            Upstream::Pdp => "pdp",
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::IdentityProvider => f.write_str("Identity provider"),
            Upstream::Pdp => f.write_str("PDP"),
        }
    }
}

/// Errors a pipeline stage can end a request with.
///
/// The engine turns each one into a status code and a JSON body exactly once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PepError {
    #[error("{0}")]
    UnrecognizedAction(String),

    #[error("Missing required headers: {}", .0.join(", "))]
    MissingHeaders(Vec<String>),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    PolicyDenied(String),

    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable { service: Upstream, message: String },

    #[error("Malformed decision response: {0}")]
    DecisionParse(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Per-connection TLS failure. Logged by the listener, never rendered.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("{0}")]
    Internal(String),
}

impl PepError {
    pub fn status(&self) -> StatusCode {
        match self {
            PepError::MissingHeaders(_)
            | PepError::InvalidRequest(_)
            | PepError::TlsHandshake(_) => StatusCode::BAD_REQUEST,
            PepError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PepError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PepError::UnrecognizedAction(_) | PepError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            PepError::UpstreamUnavailable { .. }
            | PepError::DecisionParse(_)
            | PepError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            PepError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error class for the `type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            PepError::MissingHeaders(_)
            | PepError::InvalidRequest(_)
            | PepError::PayloadTooLarge { .. } => "invalid_request_error",
            PepError::Unauthorized(_) => "authentication_error",
            PepError::UnrecognizedAction(_) | PepError::PolicyDenied(_) => "authorization_error",
            PepError::UpstreamUnavailable { .. }
            | PepError::DecisionParse(_)
            | PepError::BackendUnavailable(_) => "upstream_error",
            PepError::TlsHandshake(_) => "connection_error",
            PepError::Internal(_) => "internal_error",
        }
    }

    /// Machine-readable code for the `code` field.
    pub fn code(&self) -> String {
        match self {
            PepError::UnrecognizedAction(_) => "unrecognized_action".into(),
            PepError::MissingHeaders(_) => "missing_headers".into(),
            PepError::InvalidRequest(_) => "invalid_request".into(),
            PepError::PayloadTooLarge { .. } => "payload_too_large".into(),
            PepError::Unauthorized(_) => "unauthorized".into(),
            PepError::PolicyDenied(_) => "policy_denied".into(),
            PepError::UpstreamUnavailable { service, .. } => {
                format!("{}_unavailable", service.as_str())
            }
            PepError::DecisionParse(_) => "decision_parse_error".into(),
            PepError::BackendUnavailable(_) => "backend_unavailable".into(),
            PepError::TlsHandshake(_) => "tls_handshake_error".into(),
            PepError::Internal(_) => "internal_error".into(),
        }
    }

    /// Message shown to the client. Upstream and internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            PepError::UpstreamUnavailable { service, .. } => format!("{service} unavailable"),
            PepError::DecisionParse(_) => "PDP returned an unparseable decision".into(),
            PepError::BackendUnavailable(_) => "Backend unavailable".into(),
            PepError::Internal(_) => "Internal error".into(),
            other => other.to_string(),
        }
    }

    /// Render the error as a JSON response tagged with the request id.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let body = ErrorResponse {
            error: ErrorInfo {
                error_type: self.error_type(),
                code: self.code(),
                message: self.public_message(),
                request_id: request_id.to_string(),
            },
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

/// Standard error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: String,
    pub message: String,
    pub request_id: String,
}

impl From<ExtractError> for PepError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::MissingHeaders(headers) => PepError::MissingHeaders(headers),
            e @ ExtractError::UnrecognizedAction { .. } => {
                PepError::UnrecognizedAction(e.to_string())
            }
        }
    }
}

impl From<ValidationError> for PepError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Unauthorized(msg) => PepError::Unauthorized(msg),
            ValidationError::UpstreamUnavailable(message) => PepError::UpstreamUnavailable {
                service: Upstream::IdentityProvider,
                message,
            },
        }
    }
}

impl From<DecisionError> for PepError {
    fn from(err: DecisionError) -> Self {
        match err {
            DecisionError::Parse(e) => PepError::DecisionParse(e.to_string()),
            other => PepError::UpstreamUnavailable {
                service: Upstream::Pdp,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use rstest::rstest;

    use super::*;
    use crate::decision::ParseError;

    #[rstest]
    #[case(PepError::UnrecognizedAction("x".into()), 403, "unrecognized_action")]
    #[case(PepError::MissingHeaders(vec!["fiware-service".into()]), 400, "missing_headers")]
    #[case(PepError::PayloadTooLarge { limit: 10 }, 413, "payload_too_large")]
    #[case(PepError::Unauthorized("x".into()), 401, "unauthorized")]
    #[case(PepError::PolicyDenied("x".into()), 403, "policy_denied")]
    #[case(
        PepError::UpstreamUnavailable { service: Upstream::IdentityProvider, message: "x".into() },
        502,
        "identity_provider_unavailable"
    )]
    #[case(PepError::DecisionParse("x".into()), 502, "decision_parse_error")]
    #[case(PepError::BackendUnavailable("x".into()), 502, "backend_unavailable")]
    #[case(PepError::Internal("x".into()), 500, "internal_error")]
    fn test_status_and_code(#[case] err: PepError, #[case] status: u16, #[case] code: &str) {
        assert_eq!(err.status().as_u16(), status);
        assert_eq!(err.code(), code);
    }

    #[tokio::test]
    async fn test_response_body_shape() {
        let response =
            PepError::Unauthorized("Missing token".into()).into_response_with_id("req-1");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "req-1");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["type"], "authentication_error");
        assert_eq!(json["error"]["code"], "unauthorized");
        assert_eq!(json["error"]["message"], "Missing token");
        assert_eq!(json["error"]["request_id"], "req-1");
    }

    #[test]
    fn test_upstream_details_are_not_public() {
        let err = PepError::from(DecisionError::Transport(
            "connect to 10.0.0.7:7070 refused".into(),
        ));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(!err.public_message().contains("10.0.0.7"));
        assert!(err.to_string().contains("10.0.0.7"));
    }

    #[test]
    fn test_decision_parse_maps_to_decision_parse() {
        let err = PepError::from(DecisionError::Parse(ParseError::MissingDecision));
        assert!(matches!(err, PepError::DecisionParse(_)));
    }
}
