//! Action extraction.
//!
//! An [`ActionExtractor`] maps a raw inbound request to the semantic [`Action`]
//! the PDP is asked about. Each backend dialect supplies its own extractor;
//! the proxy selects one by name from the [`ExtractorRegistry`] at startup.

mod orion;
mod rest;

use std::{collections::BTreeMap, fmt, sync::Arc};

use http::{HeaderMap, Method};
pub use orion::OrionExtractor;
pub use rest::RestExtractor;
use serde::Serialize;

use crate::{
    config::{ConfigError, HeaderNamesConfig, PipelineConfig},
    pipeline::RawRequest,
};

/// Subservice path assumed when the request does not carry one.
pub const DEFAULT_SUBSERVICE: &str = "/";

/// What a request is attempting to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    /// Request path the action applies to (without the query string).
    pub resource_path: String,
    /// Verb understood by the PDP policies (e.g., "create", "read", "subscribe").
    pub verb: String,
    pub tenant: String,
    pub subservice_path: String,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}{})",
            self.verb, self.resource_path, self.tenant, self.subservice_path
        )
    }
}

/// Reasons an extractor cannot produce an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("No action is defined for {method} {path}")]
    UnrecognizedAction { method: Method, path: String },

    #[error("Missing required headers: {}", .0.join(", "))]
    MissingHeaders(Vec<String>),
}

/// Maps raw requests of one backend dialect to actions.
///
/// Extraction is synchronous: the request body is already buffered when the
/// extractor runs.
pub trait ActionExtractor: Send + Sync {
    /// Dialect name used in `pipeline.dialect`.
    fn name(&self) -> &'static str;

    fn extract(&self, request: &RawRequest) -> Result<Action, ExtractError>;
}

/// Tenant and subservice read from the configured headers.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    pub tenant: String,
    pub subservice_path: String,
}

/// Read the tenant (required) and subservice (defaults to `/`) headers.
pub(crate) fn read_scope(
    headers: &HeaderMap,
    names: &HeaderNamesConfig,
) -> Result<Scope, ExtractError> {
    let tenant = header_str(headers, &names.tenant).filter(|v| !v.is_empty());
    let Some(tenant) = tenant else {
        return Err(ExtractError::MissingHeaders(vec![names.tenant.clone()]));
    };

    let subservice_path = header_str(headers, &names.subservice)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_SUBSERVICE);

    Ok(Scope {
        tenant: tenant.to_string(),
        subservice_path: subservice_path.to_string(),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Generic CRUD verb for an HTTP method.
pub(crate) fn crud_verb(method: &Method) -> Option<&'static str> {
    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => Some("read"),
        Method::POST => Some("create"),
        Method::PUT | Method::PATCH => Some("update"),
        Method::DELETE => Some("delete"),
        _ => None,
    }
}

pub(crate) fn unrecognized(request: &RawRequest) -> ExtractError {
    ExtractError::UnrecognizedAction {
        method: request.method.clone(),
        path: request.uri.path().to_string(),
    }
}

type ExtractorFactory = fn(&PipelineConfig) -> Arc<dyn ActionExtractor>;

/// Startup-time registry of extraction dialects.
///
/// New dialects are added with [`ExtractorRegistry::register`] before the
/// pipeline is built; the request path never looks extractors up by name.
#[derive(Clone)]
pub struct ExtractorRegistry {
    factories: BTreeMap<&'static str, ExtractorFactory>,
}

impl ExtractorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the dialects shipped with the proxy (`orion`, `rest`).
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("orion", |config| {
            Arc::new(OrionExtractor::new(config.headers.clone()))
        });
        registry.register("rest", |config| {
            Arc::new(RestExtractor::new(config.headers.clone()))
        });
        registry
    }

    /// Register (or replace) a dialect.
    pub fn register(&mut self, name: &'static str, factory: ExtractorFactory) {
        if self.factories.insert(name, factory).is_some() {
            tracing::debug!(dialect = name, "Replaced registered extractor");
        }
    }

    /// Instantiate the extractor selected by `config.dialect`.
    pub fn create(&self, config: &PipelineConfig) -> Result<Arc<dyn ActionExtractor>, ConfigError> {
        let factory = self.factories.get(config.dialect.as_str()).ok_or_else(|| {
            ConfigError::Validation(format!(
                "Unknown pipeline.dialect '{}'. Available: {}",
                config.dialect,
                self.names().join(", ")
            ))
        })?;
        Ok(factory(config))
    }

    /// Registered dialect names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
