//! Token validation.
//!
//! [`TokenValidator`] resolves a bearer token to an [`Identity`] by asking an
//! [`IdentityProvider`] (introspection, then role lookup). Results are cached
//! per token in a [`TokenCache`] that lets at most one refresh per token run at
//! a time; concurrent callers for the same token await the same result.

mod cache;
mod keystone;

use std::{collections::BTreeSet, fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
pub use cache::{CacheEntry, TokenCache};
use chrono::{DateTime, Utc};
use futures::FutureExt;
pub use keystone::KeystoneProvider;
use tokio::time::Instant;

use crate::{config::IdentityConfig, observability::metrics};

/// Authenticated subject derived from a bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: String,
    pub subject_name: Option<String>,
    pub token: String,
    /// Role ids assigned to the subject.
    pub roles: BTreeSet<String>,
    pub expires_at: DateTime<Utc>,
    /// Name of the domain the token was issued in, if the provider reports one.
    pub domain: Option<String>,
}

impl Identity {
    /// First of `roles` held by this identity.
    pub fn has_any_role<'a>(
        &self,
        roles: impl IntoIterator<Item = &'a String>,
    ) -> Option<&'a str> {
        roles
            .into_iter()
            .find(|r| self.roles.contains(*r))
            .map(String::as_str)
    }
}

// The token is a credential: keep it out of logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("subject_id", &self.subject_id)
            .field("subject_name", &self.subject_name)
            .field("roles", &self.roles)
            .field("expires_at", &self.expires_at)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Result of token introspection, before roles are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub subject_id: String,
    pub subject_name: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub domain: Option<String>,
}

/// Why a token could not be resolved to an identity.
///
/// `Clone` because one refresh result is handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("Identity provider unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// Adapter for a concrete identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Check the token and return its subject and expiry.
    async fn introspect(&self, token: &str) -> Result<TokenInfo, ValidationError>;

    /// Role ids of the subject the token was issued to.
    async fn roles(&self, token: &str, info: &TokenInfo)
    -> Result<BTreeSet<String>, ValidationError>;
}

/// Cached, single-flight token validation.
pub struct TokenValidator {
    provider: Arc<dyn IdentityProvider>,
    cache: TokenCache,
    timeout: Duration,
}

impl TokenValidator {
    pub fn new(provider: Arc<dyn IdentityProvider>, config: &IdentityConfig) -> Self {
        Self {
            provider,
            cache: TokenCache::new(config.cache_max_age(), config.cache_max_entries),
            timeout: config.timeout(),
        }
    }

    /// Resolve a bearer token to an identity.
    ///
    /// A cached identity that has not expired is returned without network I/O.
    pub async fn validate(&self, token: &str) -> Result<Identity, ValidationError> {
        if token.trim().is_empty() {
            return Err(ValidationError::Unauthorized("Empty token".into()));
        }

        let provider = self.provider.clone();
        let timeout = self.timeout;
        let owned = token.to_string();

        self.cache
            .get_or_refresh(token, move || {
                fetch_identity(provider, owned, timeout).boxed()
            })
            .await
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }
}

async fn fetch_identity(
    provider: Arc<dyn IdentityProvider>,
    token: String,
    timeout: Duration,
) -> Result<Identity, ValidationError> {
    let info = bounded(timeout, "introspection", provider.introspect(&token)).await?;

    if info.expires_at <= Utc::now() {
        return Err(ValidationError::Unauthorized("Token has expired".into()));
    }

    let roles = bounded(timeout, "roles", provider.roles(&token, &info)).await?;

    tracing::debug!(
        subject_id = %info.subject_id,
        roles = roles.len(),
        expires_at = %info.expires_at,
        "Token validated"
    );

    Ok(Identity {
        subject_id: info.subject_id,
        subject_name: info.subject_name,
        token,
        roles,
        expires_at: info.expires_at,
        domain: info.domain,
    })
}

/// Run one identity provider call under the configured deadline.
async fn bounded<T>(
    timeout: Duration,
    call: &'static str,
    fut: impl Future<Output = Result<T, ValidationError>>,
) -> Result<T, ValidationError> {
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, fut).await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(Ok(value)) => {
            metrics::record_upstream_call("identity_provider", "success", elapsed);
            Ok(value)
        }
        Ok(Err(e)) => {
            let outcome = match &e {
                ValidationError::Unauthorized(_) => "rejected",
                ValidationError::UpstreamUnavailable(_) => "error",
            };
            metrics::record_upstream_call("identity_provider", outcome, elapsed);
            Err(e)
        }
        Err(_) => {
            metrics::record_upstream_call("identity_provider", "timeout", elapsed);
            tracing::warn!(
                call,
                timeout_ms = timeout.as_millis() as u64,
                "Identity provider call timed out"
            );
            Err(ValidationError::UpstreamUnavailable(format!(
                "{call} timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}
