//! Keystone v3 identity provider adapter.
//!
//! Introspection is `GET {introspection_path}` with the token under review in
//! `X-Subject-Token`; roles come from
//! `GET {roles_path}?user.id=<subject>&effective`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{StatusCode, header::USER_AGENT};
use serde::Deserialize;
use url::Url;

use super::{IdentityProvider, TokenInfo, ValidationError};
use crate::config::{ConfigError, IdentityConfig, join_url};

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    user: UserBody,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    domain: Option<DomainBody>,
}

#[derive(Debug, Deserialize)]
struct DomainBody {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoleAssignments {
    role_assignments: Vec<RoleAssignment>,
}

#[derive(Debug, Deserialize)]
struct RoleAssignment {
    role: RoleRef,
}

#[derive(Debug, Deserialize)]
struct RoleRef {
    id: String,
}

/// Keystone v3 adapter.
pub struct KeystoneProvider {
    client: reqwest::Client,
    introspection_url: String,
    roles_url: Url,
    service_token: Option<String>,
    user_agent: String,
}

impl KeystoneProvider {
    pub fn new(
        client: reqwest::Client,
        config: &IdentityConfig,
        user_agent: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let roles_url = Url::parse(&join_url(&config.url, &config.roles_path)).map_err(|e| {
            ConfigError::Validation(format!("identity roles URL is invalid: {e}"))
        })?;

        Ok(Self {
            client,
            introspection_url: join_url(&config.url, &config.introspection_path),
            roles_url,
            service_token: config.service_token.clone(),
            user_agent: user_agent.into(),
        })
    }

    /// Credential presented to Keystone: the service token, or the caller's own.
    fn auth_token<'a>(&'a self, token: &'a str) -> &'a str {
        self.service_token.as_deref().unwrap_or(token)
    }
}

#[async_trait]
impl IdentityProvider for KeystoneProvider {
    async fn introspect(&self, token: &str) -> Result<TokenInfo, ValidationError> {
        let response = self
            .client
            .get(&self.introspection_url)
            .header(USER_AGENT, &self.user_agent)
            .header(AUTH_TOKEN_HEADER, self.auth_token(token))
            .header(SUBJECT_TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|e| {
                ValidationError::UpstreamUnavailable(format!("introspection request failed: {e}"))
            })?;

        let status = response.status();
        match status {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                tracing::debug!(status = %status, "Token rejected by identity provider");
                return Err(ValidationError::Unauthorized(
                    "Token rejected by identity provider".into(),
                ));
            }
            s => {
                return Err(ValidationError::UpstreamUnavailable(format!(
                    "introspection returned {s}"
                )));
            }
        }

        let envelope: TokenEnvelope = response.json().await.map_err(|e| {
            ValidationError::UpstreamUnavailable(format!("malformed introspection response: {e}"))
        })?;

        let user = envelope.token.user;
        Ok(TokenInfo {
            subject_id: user.id,
            subject_name: user.name,
            expires_at: envelope.token.expires_at,
            domain: user.domain.and_then(|d| d.name),
        })
    }

    async fn roles(
        &self,
        token: &str,
        info: &TokenInfo,
    ) -> Result<BTreeSet<String>, ValidationError> {
        let mut url = self.roles_url.clone();
        url.query_pairs_mut()
            .append_pair("user.id", &info.subject_id)
            .append_key_only("effective");

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(AUTH_TOKEN_HEADER, self.auth_token(token))
            .send()
            .await
            .map_err(|e| {
                ValidationError::UpstreamUnavailable(format!("role request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ValidationError::UpstreamUnavailable(format!(
                "role lookup returned {status}"
            )));
        }

        let assignments: RoleAssignments = response.json().await.map_err(|e| {
            ValidationError::UpstreamUnavailable(format!("malformed role response: {e}"))
        })?;

        Ok(assignments
            .role_assignments
            .into_iter()
            .map(|a| a.role.id)
            .collect())
    }
}
