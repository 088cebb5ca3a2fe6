//! Prometheus metrics for the proxy.
//!
//! Provides metrics for:
//! - Inbound request counts and latency by outcome
//! - Authorization decisions by verdict and source
//! - Token cache hits, misses and shared refreshes
//! - Upstream (identity provider, PDP, backend) call latency and failures

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for the metrics endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &seconds_from_ms(&config.latency_buckets_ms),
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder.install_recorder().map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if config.enabled {
        tracing::warn!(
            "Metrics are enabled in config but the 'prometheus' feature is not compiled. \
            Rebuild with: cargo build --features prometheus"
        );
    }
    Ok(())
}

/// Convert millisecond buckets to seconds.
#[cfg(feature = "prometheus")]
fn seconds_from_ms(ms_buckets: &[f64]) -> Vec<f64> {
    ms_buckets.iter().map(|ms| ms / 1000.0).collect()
}

/// Render the current metrics in the Prometheus text format.
///
/// Returns `None` when metrics are disabled or not compiled in.
pub fn render_metrics() -> Option<String> {
    #[cfg(feature = "prometheus")]
    {
        PROMETHEUS_HANDLE.get().map(|h| h.render())
    }
    #[cfg(not(feature = "prometheus"))]
    {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record a completed inbound request.
///
/// # Arguments
/// * `method` - HTTP method of the inbound request
/// * `status` - Status code written to the client
/// * `outcome` - "responded", or the error code that ended the chain
/// * `duration_secs` - Time spent in the pipeline
pub fn record_request(method: &str, status: u16, outcome: &str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        let status_class = format!("{}xx", status / 100);

        counter!(
            "pep_requests_total",
            "method" => method.to_string(),
            "status_class" => status_class.clone(),
            "outcome" => outcome.to_string()
        )
        .increment(1);

        histogram!("pep_request_duration_seconds", "status_class" => status_class)
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (method, status, outcome, duration_secs);
    }
}

/// Record an authorization decision.
///
/// `source` is "pdp", "bypass_role" or "unrecognized_action".
pub fn record_decision(verdict: &str, source: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "pep_decisions_total",
            "verdict" => verdict.to_string(),
            "source" => source.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (verdict, source);
    }
}

/// Record a token cache lookup.
///
/// `result` is "hit", "miss" (this caller refreshes) or "shared" (joined an
/// in-flight refresh).
pub fn record_token_cache(result: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("pep_token_cache_lookups_total", "result" => result.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = result;
    }
}

/// Record a call to an upstream service.
///
/// # Arguments
/// * `service` - "identity_provider", "pdp" or "backend"
/// * `outcome` - "success", "timeout", "transport_error", "status_error" or "parse_error"
/// * `duration_secs` - Time until the upstream answered or the call failed
pub fn record_upstream_call(service: &str, outcome: &str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "pep_upstream_calls_total",
            "service" => service.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);

        histogram!("pep_upstream_call_duration_seconds", "service" => service.to_string())
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (service, outcome, duration_secs);
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
