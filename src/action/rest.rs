//! Generic REST dialect: the verb follows the HTTP method on any path.

use super::{Action, ActionExtractor, ExtractError, crud_verb, read_scope, unrecognized};
use crate::{config::HeaderNamesConfig, pipeline::RawRequest};

#[derive(Debug, Clone)]
pub struct RestExtractor {
    headers: HeaderNamesConfig,
}

impl RestExtractor {
    pub fn new(headers: HeaderNamesConfig) -> Self {
        Self { headers }
    }
}

impl ActionExtractor for RestExtractor {
    fn name(&self) -> &'static str {
        "rest"
    }

    fn extract(&self, request: &RawRequest) -> Result<Action, ExtractError> {
        let scope = read_scope(&request.headers, &self.headers)?;
        let verb = crud_verb(&request.method).ok_or_else(|| unrecognized(request))?;

        Ok(Action {
            resource_path: request.uri.path().to_string(),
            verb: verb.to_string(),
            tenant: scope.tenant,
            subservice_path: scope.subservice_path,
        })
    }
}
