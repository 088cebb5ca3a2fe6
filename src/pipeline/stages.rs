//! The default stages: extract the action, validate the token, decide, forward.

use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, header::AUTHORIZATION};

use super::{PepError, PipelineBuilder, RequestContext, Stage, StageOutcome};
use crate::{
    action::{ActionExtractor, ExtractError, ExtractorRegistry},
    config::{ConfigError, PepConfig, UnrecognizedActionPolicy},
    decision::{Decision, DecisionClient},
    forward::Forwarder,
    identity::{KeystoneProvider, TokenValidator},
    observability::metrics,
};

pub const EXTRACT_ACTION: &str = "extract_action";
pub const VALIDATE_TOKEN: &str = "validate_token";
pub const DECIDE: &str = "decide";
pub const FORWARD: &str = "forward";

/// Assemble the default chain from configuration.
///
/// The returned builder can still take extra stages (see
/// [`PipelineBuilder::insert_before`]) before it is built.
pub fn standard_builder(
    config: &PepConfig,
    registry: &ExtractorRegistry,
    client: reqwest::Client,
) -> Result<PipelineBuilder, ConfigError> {
    let user_agent = config.server.http_client.user_agent.clone();
    let extractor = registry.create(&config.pipeline)?;

    let provider = KeystoneProvider::new(client.clone(), &config.identity, user_agent.clone())?;
    let validator = TokenValidator::new(Arc::new(provider), &config.identity);
    let decisions = DecisionClient::new(client.clone(), &config.pdp, user_agent);
    let forwarder = Forwarder::new(client, &config.backend);

    let headers = &config.pipeline.headers;
    let token_header = header_name("pipeline.headers.token", &headers.token)?;
    let tenant_header = header_name("pipeline.headers.tenant", &headers.tenant)?;

    Ok(PipelineBuilder::new()
        .push(ExtractActionStage::new(extractor))
        .push(ValidateTokenStage {
            validator: Arc::new(validator),
            token_header,
            tenant_header,
            enforce_tenant_domain: config.identity.enforce_tenant_domain,
        })
        .push(DecisionStage {
            client: decisions,
            unrecognized_action: config.pipeline.unrecognized_action,
            bypass_roles: config.pipeline.bypass_roles.clone(),
        })
        .push(ForwardStage::new(forwarder)))
}

fn header_name(field: &str, value: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(value.as_bytes())
        .map_err(|_| ConfigError::Validation(format!("{field} is not a valid header name")))
}

/// Maps the request to an [`Action`](crate::action::Action).
///
/// Failures are recorded on the context rather than returned, so that a
/// request without a valid token is always answered with 401 first.
pub struct ExtractActionStage {
    extractor: Arc<dyn ActionExtractor>,
}

impl ExtractActionStage {
    pub fn new(extractor: Arc<dyn ActionExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl Stage for ExtractActionStage {
    fn name(&self) -> &str {
        EXTRACT_ACTION
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, PepError> {
        match self.extractor.extract(&ctx.request) {
            Ok(action) => {
                tracing::debug!(
                    dialect = self.extractor.name(),
                    action = %action,
                    "Extracted action"
                );
                ctx.action = Some(action);
            }
            Err(e) => {
                tracing::debug!(dialect = self.extractor.name(), error = %e, "Extraction failed");
                ctx.extraction_error = Some(e);
            }
        }
        Ok(StageOutcome::Continue)
    }
}

/// Resolves the caller's token to an identity.
pub struct ValidateTokenStage {
    pub validator: Arc<TokenValidator>,
    pub token_header: HeaderName,
    pub tenant_header: HeaderName,
    /// Reject tokens whose domain differs from the tenant header.
    pub enforce_tenant_domain: bool,
}

impl ValidateTokenStage {
    /// Token from the configured header, or from `Authorization: Bearer`,
    /// together with the header it was read from.
    fn token(&self, headers: &HeaderMap) -> Option<(String, HeaderName)> {
        if let Some(value) = headers.get(&self.token_header)
            && let Ok(token) = value.to_str()
            && !token.trim().is_empty()
        {
            return Some((token.trim().to_string(), self.token_header.clone()));
        }

        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        (scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty())
            .then(|| (token.trim().to_string(), AUTHORIZATION))
    }
}

#[async_trait]
impl Stage for ValidateTokenStage {
    fn name(&self) -> &str {
        VALIDATE_TOKEN
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, PepError> {
        ctx.consume_header(self.token_header.clone());

        let Some((token, source)) = self.token(&ctx.request.headers) else {
            return Err(PepError::Unauthorized("Missing auth token".into()));
        };
        if source == AUTHORIZATION {
            ctx.consume_header(AUTHORIZATION);
        }

        let identity = self.validator.validate(&token).await?;

        if self.enforce_tenant_domain
            && let Some(domain) = identity.domain.as_deref()
        {
            let tenant = ctx
                .request
                .headers
                .get(&self.tenant_header)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !tenant.is_empty() && !domain.eq_ignore_ascii_case(tenant) {
                tracing::info!(
                    subject_id = %identity.subject_id,
                    domain,
                    tenant,
                    "Token domain does not match tenant"
                );
                return Err(PepError::Unauthorized(
                    "Token was not issued for this tenant".into(),
                ));
            }
        }

        tracing::debug!(
            subject_id = %identity.subject_id,
            roles = identity.roles.len(),
            "Token validated"
        );
        ctx.token = Some(token);
        ctx.identity = Some(identity);
        Ok(StageOutcome::Continue)
    }
}

/// Obtains the access decision for the extracted action.
pub struct DecisionStage {
    pub client: DecisionClient,
    pub unrecognized_action: UnrecognizedActionPolicy,
    /// Roles that are permitted without consulting the PDP.
    pub bypass_roles: Vec<String>,
}

#[async_trait]
impl Stage for DecisionStage {
    fn name(&self) -> &str {
        DECIDE
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, PepError> {
        let Some(identity) = ctx.identity.as_ref() else {
            return Err(PepError::Internal(
                "Decision requested before the token was validated".into(),
            ));
        };

        let Some(action) = ctx.action.as_ref() else {
            return match ctx.extraction_error.take() {
                Some(ExtractError::UnrecognizedAction { .. })
                    if self.unrecognized_action == UnrecognizedActionPolicy::Forward =>
                {
                    tracing::info!(
                        method = %ctx.request.method,
                        path = ctx.request.uri.path(),
                        "Unrecognized action forwarded by policy"
                    );
                    metrics::record_decision("permit", "unrecognized_action");
                    ctx.decision = Some(Decision::permit("unrecognized action forwarded"));
                    Ok(StageOutcome::Continue)
                }
                Some(e) => {
                    if matches!(e, ExtractError::UnrecognizedAction { .. }) {
                        metrics::record_decision("deny", "unrecognized_action");
                    }
                    Err(e.into())
                }
                None => Err(PepError::Internal(
                    "Decision requested before the action was extracted".into(),
                )),
            };
        };

        if let Some(role) = identity.has_any_role(&self.bypass_roles) {
            tracing::info!(
                subject_id = %identity.subject_id,
                role,
                "Bypass role held, skipping PDP"
            );
            metrics::record_decision("permit", "bypass_role");
            ctx.decision = Some(Decision::permit(format!("bypass role: {role}")));
            return Ok(StageOutcome::Continue);
        }

        match self.client.decide(action, identity).await {
            Ok(decision) => {
                metrics::record_decision(&decision.verdict.to_string(), "pdp");
                let permitted = decision.is_permit();
                let reason = decision.reason.clone();
                ctx.decision = Some(decision);
                if permitted {
                    Ok(StageOutcome::Continue)
                } else {
                    Err(PepError::PolicyDenied(format!("Access denied ({reason})")))
                }
            }
            Err(e) => {
                metrics::record_decision("deny", "pdp");
                ctx.decision = Some(e.fallback_decision());
                Err(e.into())
            }
        }
    }
}

/// Relays permitted requests to the backend.
pub struct ForwardStage {
    forwarder: Forwarder,
}

impl ForwardStage {
    pub fn new(forwarder: Forwarder) -> Self {
        Self { forwarder }
    }
}

#[async_trait]
impl Stage for ForwardStage {
    fn name(&self) -> &str {
        FORWARD
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, PepError> {
        if !ctx.is_permitted() {
            return Err(PepError::Internal(
                "Forward reached without a permit decision".into(),
            ));
        }
        let response = self.forwarder.forward(ctx).await?;
        Ok(StageOutcome::Respond(response))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{HeaderValue, Method};
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::method as method_eq};

    use super::*;
    use crate::{
        action::{OrionExtractor, test_support::request},
        config::{HeaderNamesConfig, IdentityConfig, PdpConfig},
        identity::test_support::StaticProvider,
    };

    fn identity_config() -> IdentityConfig {
        toml::from_str(r#"url = "http://keystone:5000""#).unwrap()
    }

    fn validator(provider: StaticProvider) -> Arc<TokenValidator> {
        Arc::new(TokenValidator::new(Arc::new(provider), &identity_config()))
    }

    fn token_stage(provider: StaticProvider, enforce_tenant_domain: bool) -> ValidateTokenStage {
        ValidateTokenStage {
            validator: validator(provider),
            token_header: HeaderName::from_static("x-auth-token"),
            tenant_header: HeaderName::from_static("fiware-service"),
            enforce_tenant_domain,
        }
    }

    fn ctx_with(method: Method, uri: &str, headers: &[(&'static str, &str)]) -> RequestContext {
        let mut raw = request(method, uri, "");
        for (name, value) in headers {
            raw.headers
                .insert(*name, HeaderValue::from_str(value).unwrap());
        }
        RequestContext::new("req-1", raw)
    }

    fn decision_stage(
        server: &MockServer,
        policy: UnrecognizedActionPolicy,
        bypass_roles: &[&str],
    ) -> DecisionStage {
        let config: PdpConfig =
            toml::from_str(&format!(r#"url = "{}""#, server.uri())).unwrap();
        DecisionStage {
            client: DecisionClient::new(reqwest::Client::new(), &config, "test"),
            unrecognized_action: policy,
            bypass_roles: bypass_roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    async fn validated(ctx: &mut RequestContext) {
        token_stage(StaticProvider::valid("alice"), false)
            .run(ctx)
            .await
            .unwrap();
    }

    async fn extracted(ctx: &mut RequestContext) {
        ExtractActionStage::new(Arc::new(OrionExtractor::new(HeaderNamesConfig::default())))
            .run(ctx)
            .await
            .unwrap();
        assert!(ctx.action.is_some());
    }

    #[tokio::test]
    async fn test_extraction_failure_is_deferred() {
        let stage = ExtractActionStage::new(Arc::new(OrionExtractor::new(
            HeaderNamesConfig::default(),
        )));
        let mut ctx = ctx_with(Method::GET, "/not/an/orion/path", &[]);

        let outcome = stage.run(&mut ctx).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Continue));
        assert!(ctx.action.is_none());
        assert!(matches!(
            ctx.extraction_error,
            Some(ExtractError::UnrecognizedAction { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let provider = StaticProvider::valid("alice");
        let stage = token_stage(provider, false);
        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[]);

        let err = stage.run(&mut ctx).await.unwrap_err();
        assert_eq!(err, PepError::Unauthorized("Missing auth token".into()));
        assert!(ctx.identity.is_none());
    }

    #[tokio::test]
    async fn test_bearer_token_fallback() {
        let stage = token_stage(StaticProvider::valid("alice"), false);
        let mut ctx = ctx_with(
            Method::GET,
            "/v2/entities",
            &[("authorization", "Bearer abc123")],
        );

        stage.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.token.as_deref(), Some("abc123"));
        assert_eq!(ctx.identity.as_ref().unwrap().subject_id, "alice");
        assert!(ctx.consumed_headers.contains(&AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_token_header_is_consumed() {
        let stage = token_stage(StaticProvider::valid("alice"), false);
        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[("x-auth-token", "abc")]);

        stage.run(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.consumed_headers,
            vec![HeaderName::from_static("x-auth-token")]
        );
    }

    #[tokio::test]
    async fn test_backend_authorization_is_kept_when_token_header_is_used() {
        let stage = token_stage(StaticProvider::valid("alice"), false);
        let mut ctx = ctx_with(
            Method::GET,
            "/v2/entities",
            &[
                ("x-auth-token", "abc"),
                ("authorization", "Basic YmFja2VuZDpwdw=="),
            ],
        );

        stage.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.token.as_deref(), Some("abc"));
        assert!(!ctx.consumed_headers.contains(&AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_tenant_domain_mismatch_is_unauthorized() {
        let mut provider = StaticProvider::valid("alice");
        if let Ok(info) = provider.result.as_mut() {
            info.domain = Some("othercity".into());
        }
        let stage = token_stage(provider, true);
        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[("x-auth-token", "abc")]);

        let err = stage.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PepError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_tenant_domain_match_passes() {
        let mut provider = StaticProvider::valid("alice");
        if let Ok(info) = provider.result.as_mut() {
            info.domain = Some("SmartCity".into());
        }
        let stage = token_stage(provider, true);
        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[("x-auth-token", "abc")]);

        stage.run(&mut ctx).await.unwrap();
        assert!(ctx.identity.is_some());
    }

    #[tokio::test]
    async fn test_bypass_role_skips_pdp() {
        let server = MockServer::start().await;
        Mock::given(method_eq("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[("x-auth-token", "abc")]);
        validated(&mut ctx).await;
        extracted(&mut ctx).await;
        let stage = decision_stage(&server, UnrecognizedActionPolicy::Deny, &["role-a"]);

        stage.run(&mut ctx).await.unwrap();
        assert!(ctx.is_permitted());
        assert_eq!(ctx.decision.unwrap().reason, "bypass role: role-a");
    }

    #[tokio::test]
    async fn test_unrecognized_action_denied_by_default() {
        let server = MockServer::start().await;
        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[("x-auth-token", "abc")]);
        validated(&mut ctx).await;
        ctx.extraction_error = Some(ExtractError::UnrecognizedAction {
            method: Method::GET,
            path: "/weird".into(),
        });

        let stage = decision_stage(&server, UnrecognizedActionPolicy::Deny, &[]);
        let err = stage.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PepError::UnrecognizedAction(_)));
        assert!(!ctx.is_permitted());
    }

    #[tokio::test]
    async fn test_unrecognized_action_forwarded_by_policy() {
        let server = MockServer::start().await;
        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[("x-auth-token", "abc")]);
        validated(&mut ctx).await;
        ctx.extraction_error = Some(ExtractError::UnrecognizedAction {
            method: Method::GET,
            path: "/weird".into(),
        });

        let stage = decision_stage(&server, UnrecognizedActionPolicy::Forward, &[]);
        stage.run(&mut ctx).await.unwrap();
        assert!(ctx.is_permitted());
    }

    #[tokio::test]
    async fn test_missing_headers_stay_bad_request_under_forward_policy() {
        let server = MockServer::start().await;
        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[("x-auth-token", "abc")]);
        validated(&mut ctx).await;
        ctx.extraction_error = Some(ExtractError::MissingHeaders(vec!["fiware-service".into()]));

        let stage = decision_stage(&server, UnrecognizedActionPolicy::Forward, &[]);
        let err = stage.run(&mut ctx).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_pdp_failure_leaves_deny_decision() {
        let server = MockServer::start().await;
        Mock::given(method_eq("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[("x-auth-token", "abc")]);
        validated(&mut ctx).await;
        extracted(&mut ctx).await;

        let stage = decision_stage(&server, UnrecognizedActionPolicy::Deny, &[]);
        let err = stage.run(&mut ctx).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 502);
        assert!(!ctx.is_permitted());
        assert!(ctx.decision.is_some());
    }

    #[tokio::test]
    async fn test_forward_requires_permit() {
        let forwarder = Forwarder::new(
            reqwest::Client::new(),
            &crate::config::BackendConfig {
                url: "http://127.0.0.1:9".into(),
                timeout_ms: 100,
            },
        );
        let mut ctx = ctx_with(Method::GET, "/v2/entities", &[]);
        ctx.decision = Some(Decision::deny("pdp: Deny"));

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            ForwardStage::new(forwarder).run(&mut ctx),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(PepError::Internal(_))));
    }
}
