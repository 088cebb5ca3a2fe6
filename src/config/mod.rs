//! Configuration module for the PEP proxy.
//!
//! The proxy is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax. The loaded configuration
//! is immutable for the lifetime of the process.
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 1026
//!
//! [backend]
//! url = "http://orion:1026"
//!
//! [identity]
//! url = "http://keystone:5000"
//! service_token = "${PEP_SERVICE_TOKEN}"
//!
//! [pdp]
//! url = "http://keypass:7070"
//! ```

mod observability;
mod pipeline;
mod server;
mod upstream;

use std::path::Path;

pub use observability::*;
pub use pipeline::*;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use upstream::*;

/// Root configuration for the proxy.
///
/// `backend`, `identity` and `pdp` are mandatory: there is no default that
/// would let requests through without a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PepConfig {
    /// Inbound listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Protected backend.
    pub backend: BackendConfig,

    /// Identity provider used to validate tokens.
    pub identity: IdentityConfig,

    /// Policy Decision Point.
    pub pdp: PdpConfig,

    /// Request pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Observability configuration (logging, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl PepConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing variables cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: PepConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        validate_upstreams(&self.backend, &self.identity, &self.pdp)?;
        self.pipeline.validate()?;

        if !self.pipeline.bypass_roles.is_empty() {
            tracing::warn!(
                roles = ?self.pipeline.bypass_roles,
                "Bypass roles configured: holders of these roles skip the PDP"
            );
        }
        if self.pipeline.unrecognized_action == UnrecognizedActionPolicy::Forward {
            tracing::warn!(
                "pipeline.unrecognized_action = \"forward\": requests the extractor cannot \
                 classify are forwarded without a PDP decision"
            );
        }

        Ok(())
    }
}

/// Configuration and startup errors. All of them prevent the proxy from starting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TLS material: {0}")]
    Tls(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips variables that appear after a `#` comment marker on the same line.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    static VAR_RE: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").unwrap());

    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in VAR_RE.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
