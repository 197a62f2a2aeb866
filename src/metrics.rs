//! Prometheus metrics for the trust gate.
//!
//! Metrics are exported on a dedicated listener (`METRICS_PORT`, default 9090).
//! Recording functions are safe to call before the exporter is installed;
//! the `metrics` facade simply drops the samples.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `trust_gate_decisions_total` - gate outcomes (label: `outcome`)
//! - `trust_gate_trusted_ip_checks_total` - trusted-IP lookups (label: `reason`)
//! - `trust_gate_violations_total` - quota violations recorded
//! - `trust_gate_bans_total` - bans imposed
//! - `trust_gate_store_failures_total` - failed store round trips (labels: `op`, `backend`)
//! - `trust_gate_store_fallbacks_total` - requests resolved by the failure policy (label: `policy`)
//! - `trust_gate_token_verifications_total` - token checks (label: `outcome`)
//! - `trust_gate_store_circuit_opens_total` / `trust_gate_store_circuit_rejections_total`
//!
//! ## Histograms
//! - `trust_gate_store_duration_seconds` - store round-trip latency (labels: `op`, `backend`)
//!
//! ## Gauges
//! - `trust_gate_store_circuit_state` - 0 = closed, 1 = half-open, 2 = open

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

use crate::store::CircuitState;

/// Metric names as constants for consistency.
pub mod names {
    pub const DECISIONS_TOTAL: &str = "trust_gate_decisions_total";
    pub const TRUSTED_IP_CHECKS_TOTAL: &str = "trust_gate_trusted_ip_checks_total";
    pub const VIOLATIONS_TOTAL: &str = "trust_gate_violations_total";
    pub const BANS_TOTAL: &str = "trust_gate_bans_total";
    pub const STORE_FAILURES_TOTAL: &str = "trust_gate_store_failures_total";
    pub const STORE_FALLBACKS_TOTAL: &str = "trust_gate_store_fallbacks_total";
    pub const TOKEN_VERIFICATIONS_TOTAL: &str = "trust_gate_token_verifications_total";
    pub const STORE_CIRCUIT_OPENS_TOTAL: &str = "trust_gate_store_circuit_opens_total";
    pub const STORE_CIRCUIT_REJECTIONS_TOTAL: &str = "trust_gate_store_circuit_rejections_total";
    pub const STORE_DURATION_SECONDS: &str = "trust_gate_store_duration_seconds";
    pub const STORE_CIRCUIT_STATE: &str = "trust_gate_store_circuit_state";
}

/// Install the Prometheus exporter on `metrics_addr` and describe all metrics.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (e.g. the port is taken
/// or a recorder is already set).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::DECISIONS_TOTAL, "Trust gate decisions by outcome");
    describe_counter!(
        names::TRUSTED_IP_CHECKS_TOTAL,
        "Trusted IP lookups by reason"
    );
    describe_counter!(names::VIOLATIONS_TOTAL, "Rate limit violations recorded");
    describe_counter!(names::BANS_TOTAL, "Temporary bans imposed");
    describe_counter!(
        names::STORE_FAILURES_TOTAL,
        "Store round trips that failed or timed out"
    );
    describe_counter!(
        names::STORE_FALLBACKS_TOTAL,
        "Requests resolved by the store failure policy"
    );
    describe_counter!(
        names::TOKEN_VERIFICATIONS_TOTAL,
        "Session token verifications by outcome"
    );
    describe_counter!(
        names::STORE_CIRCUIT_OPENS_TOTAL,
        "Times the store circuit breaker opened"
    );
    describe_counter!(
        names::STORE_CIRCUIT_REJECTIONS_TOTAL,
        "Store calls rejected by the open circuit"
    );
    describe_histogram!(
        names::STORE_DURATION_SECONDS,
        "Store round-trip duration in seconds"
    );
    describe_gauge!(
        names::STORE_CIRCUIT_STATE,
        "Store circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Like [`init_metrics`], but only logs a failure.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_decision(outcome: &'static str) {
    counter!(names::DECISIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_trusted_ip_check(reason: &'static str) {
    counter!(names::TRUSTED_IP_CHECKS_TOTAL, "reason" => reason).increment(1);
}

pub fn record_violation() {
    counter!(names::VIOLATIONS_TOTAL).increment(1);
}

pub fn record_ban() {
    counter!(names::BANS_TOTAL).increment(1);
}

pub fn record_store_fallback(policy: &'static str) {
    counter!(names::STORE_FALLBACKS_TOTAL, "policy" => policy).increment(1);
}

pub fn record_token_verification(outcome: &'static str) {
    counter!(names::TOKEN_VERIFICATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record one store round trip; failures also bump the failure counter.
pub fn record_store_operation(op: &'static str, backend: &'static str, ok: bool, secs: f64) {
    histogram!(names::STORE_DURATION_SECONDS, "op" => op, "backend" => backend).record(secs);
    if !ok {
        counter!(names::STORE_FAILURES_TOTAL, "op" => op, "backend" => backend).increment(1);
    }
}

pub fn record_store_circuit_opened() {
    counter!(names::STORE_CIRCUIT_OPENS_TOTAL).increment(1);
}

pub fn record_store_circuit_rejection() {
    counter!(names::STORE_CIRCUIT_REJECTIONS_TOTAL).increment(1);
}

pub fn set_store_circuit_state(state: CircuitState) {
    gauge!(names::STORE_CIRCUIT_STATE).set(state.as_gauge());
}
