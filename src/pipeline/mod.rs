//! Middleware chain engine.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s assembled with a
//! [`PipelineBuilder`] before the listener starts. `build()` consumes the
//! builder, so a running pipeline can never be appended to. Each request gets
//! its own [`RequestContext`] and runs through the stages in order until one
//! responds or fails.

mod context;
mod error;
mod stages;

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;
pub use context::{RawRequest, RequestContext};
pub use error::{ErrorInfo, ErrorResponse, PepError, Upstream};
use http::HeaderValue;
pub use stages::{
    DECIDE, DecisionStage, EXTRACT_ACTION, ExtractActionStage, FORWARD, ForwardStage,
    VALIDATE_TOKEN, ValidateTokenStage, standard_builder,
};

use crate::{config::ConfigError, proxy::REQUEST_ID_HEADER};

/// Result of a stage that did not fail.
#[derive(Debug)]
pub enum StageOutcome {
    /// Hand the context to the next stage.
    Continue,
    /// Stop here and send this response.
    Respond(Response),
}

/// One step of request processing.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique name, used for ordering and diagnostics.
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, PepError>;
}

/// How the chain ended, attached to the response extensions for metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    /// Stage that produced the response.
    pub stage: String,
    /// `"responded"`, or the error code.
    pub outcome: String,
}

/// Collects stages before startup.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn push(self, stage: impl Stage + 'static) -> Self {
        self.push_arc(Arc::new(stage))
    }

    pub fn push_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Insert a stage immediately before the stage named `anchor`.
    pub fn insert_before(
        mut self,
        anchor: &str,
        stage: impl Stage + 'static,
    ) -> Result<Self, ConfigError> {
        let index = self.position(anchor)?;
        self.stages.insert(index, Arc::new(stage));
        Ok(self)
    }

    /// Insert a stage immediately after the stage named `anchor`.
    pub fn insert_after(
        mut self,
        anchor: &str,
        stage: impl Stage + 'static,
    ) -> Result<Self, ConfigError> {
        let index = self.position(anchor)?;
        self.stages.insert(index + 1, Arc::new(stage));
        Ok(self)
    }

    fn position(&self, anchor: &str) -> Result<usize, ConfigError> {
        self.stages
            .iter()
            .position(|s| s.name() == anchor)
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "No pipeline stage named '{anchor}'. Stages: {}",
                    self.stage_names().join(", ")
                ))
            })
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Freeze the stage order.
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages.into(),
        }
    }
}

/// Immutable, shareable stage list.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Stage>]>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run a request through every stage in order.
    ///
    /// The first response or error ends the chain; later stages never run. A
    /// chain that finishes without any stage responding is an internal error.
    pub async fn execute(&self, mut ctx: RequestContext) -> Response {
        let mut ended: Option<(Response, ChainOutcome)> = None;

        for stage in self.stages.iter() {
            match stage.run(&mut ctx).await {
                Ok(StageOutcome::Continue) => {}
                Ok(StageOutcome::Respond(response)) => {
                    let outcome = ChainOutcome {
                        stage: stage.name().to_string(),
                        outcome: "responded".into(),
                    };
                    ended = Some((response, outcome));
                    break;
                }
                Err(err) => {
                    log_stage_error(stage.name(), &err);
                    let outcome = ChainOutcome {
                        stage: stage.name().to_string(),
                        outcome: err.code(),
                    };
                    ended = Some((err.into_response_with_id(&ctx.request_id), outcome));
                    break;
                }
            }
        }

        let (mut response, outcome) = ended.unwrap_or_else(|| {
            let err = PepError::Internal("Pipeline finished without a response".into());
            tracing::error!(stages = ?self.stage_names(), "{err}");
            let outcome = ChainOutcome {
                stage: String::new(),
                outcome: err.code(),
            };
            (err.into_response_with_id(&ctx.request_id), outcome)
        });

        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response.extensions_mut().insert(outcome);
        response
    }
}

fn log_stage_error(stage: &str, err: &PepError) {
    match err {
        PepError::Internal(_) => {
            tracing::error!(stage, error = %err, "Stage failed");
        }
        PepError::UpstreamUnavailable { .. }
        | PepError::DecisionParse(_)
        | PepError::BackendUnavailable(_) => {
            tracing::warn!(stage, error = %err, code = %err.code(), "Upstream failure");
        }
        _ => {
            tracing::info!(stage, error = %err, code = %err.code(), "Request rejected");
        }
    }
}
