use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::ConfigError;

/// The protected service requests are forwarded to once permitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL of the backend (e.g., "http://orion:1026"). A path prefix,
    /// if present, is prepended to every forwarded path.
    pub url: String,

    /// Deadline for the backend to send response headers, in milliseconds.
    #[serde(default = "default_backend_timeout")]
    pub timeout_ms: u64,
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_url("backend.url", &self.url)?;
        validate_timeout("backend.timeout_ms", self.timeout_ms)
    }
}

fn default_backend_timeout() -> u64 {
    30_000
}

/// Identity provider (Keystone v3 style) used to introspect bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Base URL of the identity provider (e.g., "http://keystone:5000").
    pub url: String,

    /// Token introspection path. The token travels in `X-Subject-Token`.
    #[serde(default = "default_introspection_path")]
    pub introspection_path: String,

    /// Role assignment path, queried with `user.id=<subject>`.
    #[serde(default = "default_roles_path")]
    pub roles_path: String,

    /// Token the proxy presents in `X-Auth-Token` when calling the identity
    /// provider. When omitted, the caller's own token is used (self-validation).
    #[serde(default)]
    pub service_token: Option<String>,

    /// Deadline for each identity provider call, in milliseconds.
    #[serde(default = "default_identity_timeout")]
    pub timeout_ms: u64,

    /// Upper bound on how long a validated token stays cached, in seconds.
    /// The effective lifetime is `min(token expiry, now + cache_max_age_secs)`.
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age_secs: u64,

    /// Number of cached tokens before expired entries are swept.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Reject tokens whose domain differs from the request's tenant header.
    #[serde(default)]
    pub enforce_tenant_domain: bool,
}

impl IdentityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_url("identity.url", &self.url)?;
        validate_path("identity.introspection_path", &self.introspection_path)?;
        validate_path("identity.roles_path", &self.roles_path)?;
        validate_timeout("identity.timeout_ms", self.timeout_ms)?;
        if self.cache_max_entries == 0 {
            return Err(ConfigError::Validation(
                "identity.cache_max_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_introspection_path() -> String {
    "/v3/auth/tokens".to_string()
}

fn default_roles_path() -> String {
    "/v3/role_assignments".to_string()
}

fn default_identity_timeout() -> u64 {
    5_000
}

fn default_cache_max_age() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    10_000
}

/// Policy Decision Point the proxy asks for a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdpConfig {
    /// Base URL of the PDP (e.g., "http://keypass:7070").
    pub url: String,

    /// Decision endpoint path.
    #[serde(default = "default_pdp_path")]
    pub path: String,

    /// Encoding of the decision request.
    #[serde(default)]
    pub format: PdpFormat,

    /// Component name used in the XACML resource id
    /// (`fiware:<component>:<tenant>:<subservice>::`).
    #[serde(default = "default_component_name")]
    pub component_name: String,

    /// Deadline for the decision call, in milliseconds.
    #[serde(default = "default_pdp_timeout")]
    pub timeout_ms: u64,
}

impl PdpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Full decision endpoint URL.
    pub fn endpoint(&self) -> String {
        join_url(&self.url, &self.path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_url("pdp.url", &self.url)?;
        validate_path("pdp.path", &self.path)?;
        validate_timeout("pdp.timeout_ms", self.timeout_ms)?;
        if self.component_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "pdp.component_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Decision request encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdpFormat {
    /// XACML 3.0 XML request (Keypass and most XACML engines).
    #[default]
    XacmlXml,
    /// XACML 3.0 JSON profile request.
    XacmlJson,
}

fn default_pdp_path() -> String {
    "/pdp/v3".to_string()
}

fn default_component_name() -> String {
    "orion".to_string()
}

fn default_pdp_timeout() -> u64 {
    5_000
}

/// Validate every upstream section.
pub(super) fn validate_upstreams(
    backend: &BackendConfig,
    identity: &IdentityConfig,
    pdp: &PdpConfig,
) -> Result<(), ConfigError> {
    backend.validate()?;
    identity.validate()?;
    pdp.validate()
}

/// Join a base URL and a path without doubling or dropping the separator.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::Validation(format!("{field} is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Validation(format!(
            "{field} must use http or https, got '{other}'"
        ))),
    }
}

fn validate_path(field: &str, value: &str) -> Result<(), ConfigError> {
    if !value.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "{field} must start with '/'"
        )));
    }
    Ok(())
}

fn validate_timeout(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}
