use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Request pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Name of the action-extraction dialect (see `ExtractorRegistry`).
    #[serde(default = "default_dialect")]
    pub dialect: String,

    /// What to do when the extractor cannot map a request to an action.
    #[serde(default)]
    pub unrecognized_action: UnrecognizedActionPolicy,

    /// Role ids that are permitted without asking the PDP.
    #[serde(default)]
    pub bypass_roles: Vec<String>,

    /// Names of the headers the proxy reads.
    #[serde(default)]
    pub headers: HeaderNamesConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dialect: default_dialect(),
            unrecognized_action: UnrecognizedActionPolicy::default(),
            bypass_roles: Vec::new(),
            headers: HeaderNamesConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.dialect.trim().is_empty() {
            return Err(ConfigError::Validation(
                "pipeline.dialect must not be empty".into(),
            ));
        }
        if self.bypass_roles.iter().any(|r| r.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "pipeline.bypass_roles must not contain empty role ids".into(),
            ));
        }
        self.headers.validate()
    }
}

fn default_dialect() -> String {
    "orion".to_string()
}

/// Handling of requests the extractor does not recognize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnrecognizedActionPolicy {
    /// Reject with 403 (fail-closed).
    #[default]
    Deny,
    /// Validate the token, skip the PDP and forward.
    Forward,
}

/// Names of the headers carrying tenant, subservice and token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderNamesConfig {
    #[serde(default = "default_tenant_header")]
    pub tenant: String,

    #[serde(default = "default_subservice_header")]
    pub subservice: String,

    /// Token header. `Authorization: Bearer <token>` is accepted as a fallback.
    #[serde(default = "default_token_header")]
    pub token: String,
}

impl Default for HeaderNamesConfig {
    fn default() -> Self {
        Self {
            tenant: default_tenant_header(),
            subservice: default_subservice_header(),
            token: default_token_header(),
        }
    }
}

impl HeaderNamesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("tenant", &self.tenant),
            ("subservice", &self.subservice),
            ("token", &self.token),
        ] {
            if http::HeaderName::from_bytes(value.as_bytes()).is_err() {
                return Err(ConfigError::Validation(format!(
                    "pipeline.headers.{field} is not a valid header name: '{value}'"
                )));
            }
        }
        Ok(())
    }
}

fn default_tenant_header() -> String {
    "fiware-service".to_string()
}

fn default_subservice_header() -> String {
    "fiware-servicepath".to_string()
}

fn default_token_header() -> String {
    "x-auth-token".to_string()
}
