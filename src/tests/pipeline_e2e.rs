//! End-to-end pipeline tests using wiremock.
//!
//! Each test builds the real router from a TOML config pointing at three mock
//! servers (identity provider, PDP, backend). Call counts are asserted with
//! `expect(n)`, which wiremock verifies when the servers are dropped.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use futures::future::join_all;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path},
};

use crate::{
    action::ExtractorRegistry,
    config::PepConfig,
    pipeline::standard_builder,
    proxy::{REQUEST_ID_HEADER, proxy_router},
};

pub(super) const TOKEN: &str = "gAAAAABtoken";
pub(super) const TENANT: &str = "smartcity";

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    app: Router,
    idp: MockServer,
    pdp: MockServer,
    backend: MockServer,
}

impl Harness {
    async fn new() -> Self {
        Self::with_pipeline("").await
    }

    /// Build the app with extra keys appended to the `[pipeline]` table.
    async fn with_pipeline(pipeline: &str) -> Self {
        let idp = MockServer::start().await;
        let pdp = MockServer::start().await;
        let backend = MockServer::start().await;
        let app = build_app(&idp.uri(), &pdp.uri(), &backend.uri(), pipeline, 1024 * 1024);
        Self {
            app,
            idp,
            pdp,
            backend,
        }
    }

    /// Token introspection and role lookup for [`TOKEN`].
    async fn mount_identity(&self, roles: &[&str], expected_introspections: u64) {
        self.mount_identity_with_delay(roles, expected_introspections, Duration::ZERO)
            .await;
    }

    async fn mount_identity_with_delay(&self, roles: &[&str], expected: u64, delay: Duration) {
        Mock::given(method("GET"))
            .and(path("/v3/auth/tokens"))
            .and(header("X-Subject-Token", TOKEN))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body())
                    .set_delay(delay),
            )
            .expect(expected)
            .mount(&self.idp)
            .await;

        let assignments: Vec<Value> = roles
            .iter()
            .map(|r| json!({ "role": { "id": r } }))
            .collect();
        Mock::given(method("GET"))
            .and(path("/v3/role_assignments"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "role_assignments": assignments })),
            )
            .expect(expected)
            .mount(&self.idp)
            .await;
    }

    async fn mount_decision(&self, decision: &str, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/pdp/v3"))
            .and(header("Fiware-Service", TENANT))
            .respond_with(xml_decision(decision))
            .expect(expected)
            .mount(&self.pdp)
            .await;
    }

    async fn expect_no_pdp_call(&self) {
        Mock::given(method("POST"))
            .respond_with(xml_decision("Permit"))
            .expect(0)
            .mount(&self.pdp)
            .await;
    }

    async fn expect_no_backend_call(&self) {
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&self.backend)
            .await;
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, http::HeaderMap, Vec<u8>) {
        send(&self.app, request).await
    }
}

fn build_app(idp: &str, pdp: &str, backend: &str, pipeline: &str, body_limit: usize) -> Router {
    let config = PepConfig::from_str(&format!(
        r#"
        [server]
        body_limit_bytes = {body_limit}

        [backend]
        url = "{backend}"
        timeout_ms = 2000

        [identity]
        url = "{idp}"
        service_token = "pep-service-token"
        timeout_ms = 2000

        [pdp]
        url = "{pdp}"
        timeout_ms = 500

        [pipeline]
        {pipeline}
    "#
    ))
    .unwrap();

    let pipeline = standard_builder(
        &config,
        &ExtractorRegistry::with_builtin(),
        config.server.http_client.build_client().unwrap(),
    )
    .unwrap()
    .build();
    proxy_router(pipeline, config.server.body_limit_bytes)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

pub(super) fn token_body() -> Value {
    json!({
        "token": {
            "expires_at": "2099-01-01T00:00:00.000000Z",
            "user": {
                "id": "user-1",
                "name": "alice",
                "domain": { "id": "d1", "name": TENANT }
            }
        }
    })
}

pub(super) fn xml_decision(decision: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        format!(
            r#"<Response xmlns="urn:oasis:names:tc:xacml:3.0:core:schema:wd-17"><Result><Decision>{decision}</Decision></Result></Response>"#
        ),
        "application/xml",
    )
}

pub(super) fn update_context_body() -> Value {
    json!({
        "contextElements": [{
            "type": "Room",
            "isPattern": "false",
            "id": "Room1",
            "attributes": [{ "name": "temperature", "type": "float", "value": "23" }]
        }],
        "updateAction": "APPEND"
    })
}

fn update_context_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/NGSI10/updateContext")
        .header("X-Auth-Token", TOKEN)
        .header("Fiware-Service", TENANT)
        .header("Fiware-ServicePath", "/parks")
        .header("content-type", "application/json")
        .body(Body::from(update_context_body().to_string()))
        .unwrap()
}

fn get_entities(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri("/v2/entities?type=Room")
        .header("Fiware-Service", TENANT);
    if let Some(token) = token {
        builder = builder.header("X-Auth-Token", token);
    }
    builder.body(Body::empty()).unwrap()
}

fn error_code(body: &[u8]) -> String {
    let json: Value = serde_json::from_slice(body).unwrap();
    json["error"]["code"].as_str().unwrap_or_default().to_string()
}

/// A port with nothing listening on it.
fn closed_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_update_context_permit_is_forwarded_verbatim() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.mount_decision("Permit", 1).await;
    Mock::given(method("POST"))
        .and(path("/NGSI10/updateContext"))
        .and(header("Fiware-Service", TENANT))
        .and(body_json(update_context_body()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&harness.backend)
        .await;

    let (status, headers, body) = harness.send(update_context_request()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({}));
    assert!(headers.contains_key(REQUEST_ID_HEADER));

    // The proxy's own credential never reaches the backend.
    let forwarded = harness.backend.received_requests().await.unwrap();
    assert!(forwarded[0].headers.get("x-auth-token").is_none());
}

#[tokio::test]
async fn test_update_context_deny_is_forbidden() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.mount_decision("Deny", 1).await;
    harness.expect_no_backend_call().await;

    let (status, headers, body) = harness.send(update_context_request()).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "policy_denied");
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        json["error"]["request_id"].as_str().unwrap(),
        headers.get(REQUEST_ID_HEADER).unwrap().to_str().unwrap()
    );
}

#[tokio::test]
async fn test_missing_token_is_unauthorized_without_upstream_calls() {
    let harness = Harness::new().await;
    harness.mount_identity(&[], 0).await;
    harness.expect_no_pdp_call().await;
    harness.expect_no_backend_call().await;

    let (status, _, body) = harness.send(get_entities(None)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "unauthorized");
}

#[tokio::test]
async fn test_rejected_token_is_unauthorized() {
    let harness = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/v3/auth/tokens"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&harness.idp)
        .await;
    harness.expect_no_pdp_call().await;
    harness.expect_no_backend_call().await;

    let (status, _, _) = harness.send(get_entities(Some("revoked"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_pdp_error_is_bad_gateway() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&harness.pdp)
        .await;
    harness.expect_no_backend_call().await;

    let (status, _, body) = harness.send(get_entities(Some(TOKEN))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "pdp_unavailable");
}

#[tokio::test]
async fn test_pdp_timeout_is_bad_gateway() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    Mock::given(method("POST"))
        .respond_with(xml_decision("Permit").set_delay(Duration::from_secs(3)))
        .mount(&harness.pdp)
        .await;
    harness.expect_no_backend_call().await;

    let (status, _, body) = harness.send(get_entities(Some(TOKEN))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "pdp_unavailable");
}

#[tokio::test]
async fn test_malformed_decision_is_not_forwarded() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("<Response><Result>", "application/xml"),
        )
        .expect(1)
        .mount(&harness.pdp)
        .await;
    harness.expect_no_backend_call().await;

    let (status, _, body) = harness.send(get_entities(Some(TOKEN))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "decision_parse_error");
}

#[tokio::test]
async fn test_unreachable_identity_provider_is_bad_gateway() {
    let pdp = MockServer::start().await;
    let backend = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(xml_decision("Permit"))
        .expect(0)
        .mount(&pdp)
        .await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&backend)
        .await;

    let idp = format!("http://127.0.0.1:{}", closed_port());
    let app = build_app(&idp, &pdp.uri(), &backend.uri(), "", 1024);

    let (status, _, body) = send(&app, get_entities(Some(TOKEN))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "identity_provider_unavailable");
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    let idp = MockServer::start().await;
    let pdp = MockServer::start().await;
    let backend = format!("http://127.0.0.1:{}", closed_port());
    let harness = Harness {
        app: build_app(&idp.uri(), &pdp.uri(), &backend, "", 1024),
        idp,
        pdp,
        backend: MockServer::start().await,
    };
    harness.mount_identity(&["role-a"], 1).await;
    harness.mount_decision("Permit", 1).await;

    let (status, _, body) = harness.send(get_entities(Some(TOKEN))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "backend_unavailable");
}

#[tokio::test]
async fn test_backend_status_and_body_pass_through() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.mount_decision("Permit", 1).await;
    Mock::given(method("GET"))
        .and(path("/v2/entities"))
        .respond_with(
            ResponseTemplate::new(404).set_body_raw(
                r#"{"error":"NotFound","description":"no entity"}"#,
                "application/json",
            ),
        )
        .expect(1)
        .mount(&harness.backend)
        .await;

    let (status, _, body) = harness.send(get_entities(Some(TOKEN))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, br#"{"error":"NotFound","description":"no entity"}"#);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_introspection() {
    let harness = Harness::new().await;
    harness
        .mount_identity_with_delay(&["role-a"], 1, Duration::from_millis(200))
        .await;
    harness.mount_decision("Permit", 10).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(10)
        .mount(&harness.backend)
        .await;

    let responses = join_all((0..10).map(|_| harness.send(get_entities(Some(TOKEN))))).await;

    assert!(responses.iter().all(|(status, _, _)| *status == StatusCode::OK));
}

#[tokio::test]
async fn test_cached_identity_skips_introspection() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.mount_decision("Permit", 2).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&harness.backend)
        .await;

    for _ in 0..2 {
        let (status, _, _) = harness.send(get_entities(Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_missing_tenant_header_is_bad_request() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.expect_no_pdp_call().await;
    harness.expect_no_backend_call().await;

    let request = Request::builder()
        .uri("/v2/entities")
        .header("X-Auth-Token", TOKEN)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = harness.send(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "missing_headers");
}

#[tokio::test]
async fn test_unrecognized_action_is_forbidden_by_default() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.expect_no_pdp_call().await;
    harness.expect_no_backend_call().await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/reset")
        .header("X-Auth-Token", TOKEN)
        .header("Fiware-Service", TENANT)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = harness.send(request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "unrecognized_action");
}

#[tokio::test]
async fn test_unrecognized_action_forward_policy() {
    let harness = Harness::with_pipeline(r#"unrecognized_action = "forward""#).await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.expect_no_pdp_call().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("orion"))
        .expect(1)
        .mount(&harness.backend)
        .await;

    let request = Request::builder()
        .uri("/version")
        .header("X-Auth-Token", TOKEN)
        .header("Fiware-Service", TENANT)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = harness.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"orion");
}

#[tokio::test]
async fn test_bypass_role_skips_pdp() {
    let harness = Harness::with_pipeline(r#"bypass_roles = ["admin-role"]"#).await;
    harness.mount_identity(&["admin-role"], 1).await;
    harness.expect_no_pdp_call().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&harness.backend)
        .await;

    let (status, _, _) = harness.send(get_entities(Some(TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_bearer_authorization_header() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.mount_decision("Permit", 1).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&harness.backend)
        .await;

    let request = Request::builder()
        .uri("/v2/entities")
        .header("Authorization", format!("Bearer {TOKEN}"))
        .header("Fiware-Service", TENANT)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = harness.send(request).await;

    assert_eq!(status, StatusCode::OK);
    let forwarded = harness.backend.received_requests().await.unwrap();
    assert!(forwarded[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_backend_authorization_passes_through_with_token_header() {
    let harness = Harness::new().await;
    harness.mount_identity(&["role-a"], 1).await;
    harness.mount_decision("Permit", 1).await;
    Mock::given(method("GET"))
        .and(header("authorization", "Basic YmFja2VuZDpwdw=="))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&harness.backend)
        .await;

    let request = Request::builder()
        .uri("/v2/entities")
        .header("X-Auth-Token", TOKEN)
        .header("Authorization", "Basic YmFja2VuZDpwdw==")
        .header("Fiware-Service", TENANT)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = harness.send(request).await;

    assert_eq!(status, StatusCode::OK);
    let forwarded = harness.backend.received_requests().await.unwrap();
    assert!(forwarded[0].headers.get("x-auth-token").is_none());
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let idp = MockServer::start().await;
    let pdp = MockServer::start().await;
    let backend = MockServer::start().await;
    let app = build_app(&idp.uri(), &pdp.uri(), &backend.uri(), "", 16);
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&backend)
        .await;

    let (status, _, body) = send(&app, update_context_request()).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(&body), "payload_too_large");
}

#[tokio::test]
async fn test_client_request_id_is_echoed() {
    let harness = Harness::new().await;
    harness.expect_no_backend_call().await;

    let request = Request::builder()
        .uri("/v2/entities")
        .header("Fiware-Service", TENANT)
        .header(REQUEST_ID_HEADER, "corr-123")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = harness.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "corr-123");
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["request_id"], "corr-123");
}
