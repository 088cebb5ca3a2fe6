use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Inbound listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port the proxy listens on. Use 0 to let the OS pick one.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum inbound request body size in bytes.
    ///
    /// The body is buffered so the action extractor can inspect it, then
    /// forwarded unchanged.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// TLS configuration. If omitted, serves plain HTTP.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Port for the administrative listener (`/version`, `/health`, `/metrics`).
    /// Disabled when omitted.
    #[serde(default)]
    pub admin_port: Option<u16>,

    /// Seconds to wait for in-flight requests when stopping.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// HTTP client configuration for outbound requests (identity provider,
    /// PDP and backend share one pooled client).
    #[serde(default)]
    pub http_client: HttpClientConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            tls: None,
            admin_port: None,
            shutdown_grace_secs: default_shutdown_grace(),
            http_client: HttpClientConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.body_limit_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.body_limit_bytes must be greater than 0".into(),
            ));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        if let Some(admin_port) = self.admin_port
            && admin_port != 0
            && admin_port == self.port
        {
            return Err(ConfigError::Validation(format!(
                "server.admin_port ({admin_port}) must differ from server.port"
            )));
        }
        Ok(())
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    1026
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_shutdown_grace() -> u64 {
    30
}

/// TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Path to the certificate chain (PEM format).
    pub cert_path: String,

    /// Path to the private key (PEM format).
    pub key_path: String,
}

impl TlsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.tls.cert_path must not be empty".into(),
            ));
        }
        if self.key_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.tls.key_path must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP client configuration for outbound requests.
///
/// A single `reqwest::Client` is shared by the token validator, the decision
/// client and the forwarder. reqwest keeps a separate pool per host, so the
/// three upstreams don't compete for connections. Per-call deadlines are set
/// on each upstream section, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Enable verbose connection logging for debugging.
    #[serde(default)]
    pub verbose: bool,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_http_client_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum idle connections to keep per host.
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds.
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// TCP keepalive interval in seconds. Set to 0 to disable.
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive_secs: u64,

    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,

    /// User-Agent header for calls the proxy originates (identity provider, PDP).
    /// Forwarded requests keep the client's own User-Agent.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            connect_timeout_ms: default_http_client_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            tcp_nodelay: default_tcp_nodelay(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpClientConfig {
    /// Build a reqwest Client from this configuration.
    ///
    /// Redirects are never followed: a redirecting upstream is reported as a
    /// non-2xx answer instead of being chased.
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .connection_verbose(self.verbose)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(self.pool_idle_timeout_secs))
            .tcp_nodelay(self.tcp_nodelay)
            .redirect(reqwest::redirect::Policy::none());

        // TCP keepalive (0 means disabled)
        if self.tcp_keepalive_secs > 0 {
            builder = builder.tcp_keepalive(Duration::from_secs(self.tcp_keepalive_secs));
        }

        builder.build()
    }
}

// Default: 2 seconds to establish a connection
fn default_http_client_connect_timeout() -> u64 {
    2_000
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_tcp_keepalive() -> u64 {
    60
}

fn default_tcp_nodelay() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("pep-proxy/{}", env!("CARGO_PKG_VERSION"))
}
