//! Request pipeline.
//!
//! # Data Flow
//! ```text
//! request
//!     → inspect: rate_limit → csrf          (first error ends the chain)
//!     → handler                              (skipped on rejection)
//!     → finish: rate_limit → csrf → sanitize → security_headers
//! response
//! ```
//!
//! # Design Decisions
//! - Stages are plain trait objects iterated in order, no nested layers
//! - `finish` runs on every response, so rejections get security headers too
//! - Per-request state travels in a private `Extensions`, not on the request

mod rendered;

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Extensions, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

pub use rendered::RenderedHtml;

use crate::config::{validate_config, GuardConfig};
use crate::error::GuardError;
use crate::observability::metrics;
use crate::security::{
    CsrfGuard, PolicyHeaderInjector, RateLimitStage, RateLimiter, SanitizationPolicy,
    SanitizeStage, TokenVerifier,
};

/// One step of the pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Examine the request before the handler runs. An error rejects it.
    fn inspect(&self, _request: &mut Request<Body>, _ctx: &mut Extensions) -> Result<(), GuardError> {
        Ok(())
    }

    /// Adjust the outgoing response. Runs for handler output and rejections alike.
    fn finish(&self, _ctx: &Extensions, _response: &mut Response) {}
}

/// Ordered stages around a handler.
#[derive(Clone)]
pub struct RequestPipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl RequestPipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Build the standard chain from validated configuration.
    pub fn from_config(
        config: &GuardConfig,
        limiter: Arc<RateLimiter>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Self, GuardError> {
        validate_config(config).map_err(GuardError::PolicyConfigInvalid)?;

        let policy = Arc::new(SanitizationPolicy::from_config(&config.sanitizer));
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RateLimitStage::new(limiter, &config.rate_limit)),
            Arc::new(CsrfGuard::new(verifier, &config.csrf)?),
            Arc::new(SanitizeStage::new(policy)),
            Arc::new(PolicyHeaderInjector::from_config(config)?),
        ];
        Ok(Self::new(stages))
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run `request` through every stage and, if none rejects it, `handler`.
    pub async fn run<F, Fut>(&self, mut request: Request<Body>, handler: F) -> Response
    where
        F: FnOnce(Request<Body>) -> Fut,
        Fut: Future<Output = Response>,
    {
        let mut ctx = Extensions::new();

        let mut rejection = None;
        for stage in &self.stages {
            if let Err(err) = stage.inspect(&mut request, &mut ctx) {
                tracing::debug!(stage = stage.name(), reason = err.reason(), "Request rejected");
                metrics::record_rejection(err.reason());
                rejection = Some(err);
                break;
            }
        }

        let mut response = match rejection {
            Some(err) => err.into_response(),
            None => handler(request).await,
        };

        for stage in &self.stages {
            stage.finish(&ctx, &mut response);
        }

        metrics::record_request(response.status().as_u16());
        response
    }
}

/// axum adapter: `middleware::from_fn_with_state(pipeline, pipeline_middleware)`.
pub async fn pipeline_middleware(
    State(pipeline): State<Arc<RequestPipeline>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    pipeline.run(request, |request| next.run(request)).await
}
