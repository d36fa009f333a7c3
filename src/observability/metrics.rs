//! Metrics collection and exposition.
//!
//! # Metrics
//! - `guard_requests_total` (counter): responses leaving the pipeline, by status
//! - `guard_rejections_total` (counter): requests stopped by a stage, by reason
//! - `guard_sanitized_fields_total` (counter): HTML fields rendered through the sanitizer
//! - `guard_sanitizer_parse_errors_total` (counter): inputs cut short by unterminated markup
//! - `guard_rate_windows` (gauge): live rate-limit windows
//! - `guard_sessions` (gauge): registered sessions
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; the Prometheus exporter is optional
//! - Labels are low-cardinality: status code and rejection reason only

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(status: u16) {
    ::metrics::counter!("guard_requests_total", "status" => status.to_string()).increment(1);
}

pub fn record_rejection(reason: &'static str) {
    ::metrics::counter!("guard_rejections_total", "reason" => reason).increment(1);
}

pub fn record_sanitized(fields: usize) {
    ::metrics::counter!("guard_sanitized_fields_total").increment(fields as u64);
}

pub fn record_sanitizer_parse_error() {
    ::metrics::counter!("guard_sanitizer_parse_errors_total").increment(1);
}

pub fn record_rate_windows(count: usize) {
    ::metrics::gauge!("guard_rate_windows").set(count as f64);
}

pub fn record_sessions(count: usize) {
    ::metrics::gauge!("guard_sessions").set(count as f64);
}
