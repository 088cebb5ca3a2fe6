//! Access decisions.
//!
//! [`DecisionClient`] asks the PDP whether an identity may perform an action.
//! Only a well-formed `Permit` answer yields [`Verdict::Permit`]; every
//! failure surfaces as a [`DecisionError`] whose [`DecisionError::fallback_decision`]
//! is a deny.

pub mod xacml;

use std::{fmt, time::Duration};

use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use tokio::time::Instant;
pub use xacml::{ParseError, XacmlDecision};

use crate::{
    action::Action,
    config::{PdpConfig, PdpFormat},
    identity::Identity,
    observability::metrics,
};

const ACCEPT_RESPONSES: &str = "application/xml, application/json;q=0.9";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Permit,
    Deny,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Permit => f.write_str("permit"),
            Verdict::Deny => f.write_str("deny"),
        }
    }
}

/// Outcome of an authorization check. Request-scoped and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: String,
}

impl Decision {
    pub fn permit(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Permit,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason: reason.into(),
        }
    }

    pub fn is_permit(&self) -> bool {
        self.verdict == Verdict::Permit
    }
}

impl From<XacmlDecision> for Decision {
    fn from(value: XacmlDecision) -> Self {
        let reason = format!("pdp: {}", value.as_str());
        match value {
            XacmlDecision::Permit => Decision::permit(reason),
            XacmlDecision::Deny | XacmlDecision::NotApplicable | XacmlDecision::Indeterminate => {
                Decision::deny(reason)
            }
        }
    }
}

/// Failure to obtain a decision from the PDP.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("PDP did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("PDP request failed: {0}")]
    Transport(String),

    #[error("PDP returned status {0}")]
    Status(u16),

    #[error("Unparseable PDP response: {0}")]
    Parse(#[from] ParseError),
}

impl DecisionError {
    /// The decision that stands when the PDP could not be consulted.
    pub fn fallback_decision(&self) -> Decision {
        Decision::deny(self.to_string())
    }

    fn metric_outcome(&self) -> &'static str {
        match self {
            DecisionError::Timeout(_) => "timeout",
            DecisionError::Transport(_) => "transport_error",
            DecisionError::Status(_) => "status_error",
            DecisionError::Parse(_) => "parse_error",
        }
    }
}

/// Client for the Policy Decision Point.
#[derive(Clone)]
pub struct DecisionClient {
    client: reqwest::Client,
    endpoint: String,
    format: PdpFormat,
    component: String,
    timeout: Duration,
    user_agent: String,
}

impl DecisionClient {
    pub fn new(
        client: reqwest::Client,
        config: &PdpConfig,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: config.endpoint(),
            format: config.format,
            component: config.component_name.clone(),
            timeout: config.timeout(),
            user_agent: user_agent.into(),
        }
    }

    /// Ask the PDP for a verdict.
    ///
    /// Sending the request and reading the answer share one deadline.
    pub async fn decide(
        &self,
        action: &Action,
        identity: &Identity,
    ) -> Result<Decision, DecisionError> {
        let body = xacml::build_request(self.format, &self.component, action, identity);

        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.exchange(action, body)).await {
            Ok(result) => result,
            Err(_) => Err(DecisionError::Timeout(self.timeout)),
        };
        let elapsed = start.elapsed().as_secs_f64();

        match &result {
            Ok(decision) => {
                metrics::record_upstream_call("pdp", "success", elapsed);
                tracing::debug!(
                    verdict = %decision.verdict,
                    reason = %decision.reason,
                    action = %action,
                    subject_id = %identity.subject_id,
                    "PDP decision"
                );
            }
            Err(e) => {
                metrics::record_upstream_call("pdp", e.metric_outcome(), elapsed);
                tracing::warn!(
                    error = %e,
                    endpoint = %self.endpoint,
                    action = %action,
                    "PDP call failed, denying"
                );
            }
        }

        result
    }

    async fn exchange(&self, action: &Action, body: String) -> Result<Decision, DecisionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, xacml::content_type(self.format))
            .header(ACCEPT, ACCEPT_RESPONSES)
            .header(USER_AGENT, &self.user_agent)
            .header("Fiware-Service", &action.tenant)
            .body(body)
            .send()
            .await
            .map_err(|e| DecisionError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DecisionError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DecisionError::Transport(e.to_string()))?;

        let decision = xacml::parse_response(content_type.as_deref(), &bytes)?;
        Ok(decision.into())
    }
}
