//! FIWARE Orion Context Broker dialect.
//!
//! Covers the NGSIv1 standard (`/NGSI10`, `/NGSI9`), NGSIv1 convenience
//! (`/v1`, `/v1/registry`) and NGSIv2 (`/v2`) operations. Batch updates carry
//! their real action in the JSON body, so those rules read the payload.

use std::sync::LazyLock;

use http::Method;
use regex::Regex;

use super::{Action, ActionExtractor, ExtractError, crud_verb, read_scope, unrecognized};
use crate::{config::HeaderNamesConfig, pipeline::RawRequest};

/// How a matched path resolves to a verb.
#[derive(Debug, Clone, Copy)]
enum Rule {
    /// POST-only operation with a fixed verb.
    Post(&'static str),
    /// Resource path whose verb follows the HTTP method.
    Crud,
    /// Reads map to the first verb, every write method to the second.
    Split(&'static str, &'static str),
    /// Read-only resource.
    Get(&'static str),
    /// POST whose verb is the named JSON field of the body.
    Body(&'static str),
}

static RULES: LazyLock<Vec<(Regex, Rule)>> = LazyLock::new(|| {
    [
        // Batch updates
        (r"^/(NGSI10|v1)/updateContext/?$", Rule::Body("updateAction")),
        (r"^/v2/op/update/?$", Rule::Body("actionType")),
        // Queries
        (r"^/(NGSI10|v1)/queryContext/?$", Rule::Post("read")),
        (r"^/v2/op/query/?$", Rule::Post("read")),
        // Context subscriptions
        (
            r"^/(NGSI10|v1)/(subscribeContext|updateContextSubscription|unsubscribeContext)/?$",
            Rule::Post("subscribe"),
        ),
        // Registrations and availability
        (r"^/(NGSI9|v1/registry)/registerContext/?$", Rule::Post("register")),
        (
            r"^/(NGSI9|v1/registry)/discoverContextAvailability/?$",
            Rule::Post("discover"),
        ),
        (
            r"^/(NGSI9|v1/registry)/(subscribeContextAvailability|updateContextAvailabilitySubscription|unsubscribeContextAvailability)/?$",
            Rule::Post("subscribe-availability"),
        ),
        (
            r"^/(NGSI9|v1/registry)/(contextEntities|contextEntityTypes)(/.*)?$",
            Rule::Split("discover", "register"),
        ),
        // Convenience operations on entities
        (r"^/(NGSI10|v1)/(contextEntities|contextEntityTypes)(/.*)?$", Rule::Crud),
        (
            r"^/(NGSI10|v1)/contextSubscriptions(/.*)?$",
            Rule::Split("read", "subscribe"),
        ),
        // NGSIv2
        (r"^/v2/entities(/.*)?$", Rule::Crud),
        (r"^/v2/types(/.*)?$", Rule::Get("read")),
        (r"^/v2/subscriptions(/.*)?$", Rule::Split("read", "subscribe")),
        (r"^/v2/registrations(/.*)?$", Rule::Split("discover", "register")),
        (r"^/v2/?$", Rule::Get("read")),
    ]
    .into_iter()
    .map(|(pattern, rule)| (Regex::new(pattern).unwrap(), rule))
    .collect()
});

/// Extractor for the Orion Context Broker.
#[derive(Debug, Clone)]
pub struct OrionExtractor {
    headers: HeaderNamesConfig,
}

impl OrionExtractor {
    pub fn new(headers: HeaderNamesConfig) -> Self {
        Self { headers }
    }
}

impl ActionExtractor for OrionExtractor {
    fn name(&self) -> &'static str {
        "orion"
    }

    fn extract(&self, request: &RawRequest) -> Result<Action, ExtractError> {
        let scope = read_scope(&request.headers, &self.headers)?;
        let path = request.uri.path();

        let rule = RULES
            .iter()
            .find(|(re, _)| re.is_match(path))
            .map(|(_, rule)| *rule)
            .ok_or_else(|| unrecognized(request))?;

        let verb = resolve(rule, request).ok_or_else(|| unrecognized(request))?;

        Ok(Action {
            resource_path: path.to_string(),
            verb: verb.to_string(),
            tenant: scope.tenant,
            subservice_path: scope.subservice_path,
        })
    }
}

fn resolve(rule: Rule, request: &RawRequest) -> Option<&'static str> {
    let method = &request.method;
    match rule {
        Rule::Post(verb) => (*method == Method::POST).then_some(verb),
        Rule::Crud => crud_verb(method),
        Rule::Split(read, write) => match *method {
            Method::GET | Method::HEAD => Some(read),
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE => Some(write),
            _ => None,
        },
        Rule::Get(verb) => matches!(*method, Method::GET | Method::HEAD).then_some(verb),
        Rule::Body(field) => {
            if *method != Method::POST {
                return None;
            }
            body_update_verb(&request.body, field)
        }
    }
}

/// Map the update type carried in a batch-update body to a verb.
///
/// Accepts both the NGSIv1 spelling (`APPEND_STRICT`) and the NGSIv2 one
/// (`appendStrict`).
fn body_update_verb(body: &[u8], field: &str) -> Option<&'static str> {
    let payload: serde_json::Value = serde_json::from_slice(body).ok()?;
    let raw = payload.get(field)?.as_str()?;
    let normalized = raw.replace('_', "").to_ascii_lowercase();

    match normalized.as_str() {
        "append" | "appendstrict" => Some("create"),
        "update" | "replace" => Some("update"),
        "delete" => Some("delete"),
        other => {
            tracing::debug!(field, value = other, "Unknown update type in request body");
            None
        }
    }
}
