//! Prometheus metrics for the bridge coordinator
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // Pipeline outcomes
    pub static ref TRANSFERS_INITIATED: CounterVec = register_counter_vec!(
        "coordinator_transfers_initiated_total",
        "Transfer requests by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref STATUS_TRANSITIONS: CounterVec = register_counter_vec!(
        "coordinator_status_transitions_total",
        "Applied status transitions",
        &["to"]
    ).unwrap();

    pub static ref INVALID_TRANSITIONS: CounterVec = register_counter_vec!(
        "coordinator_invalid_transitions_total",
        "Rejected status transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref LIMIT_DENIALS: CounterVec = register_counter_vec!(
        "coordinator_limit_denials_total",
        "Transfers rejected by the rolling limit windows",
        &["scope"]
    ).unwrap();

    // Relay
    pub static ref RELAY_ATTEMPTS: CounterVec = register_counter_vec!(
        "coordinator_relay_attempts_total",
        "Relay submission attempts by result",
        &["result"]
    ).unwrap();

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "coordinator_relay_latency_seconds",
        "Time from first relay attempt to final answer",
        &["result"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    pub static ref NONCE_REFRESHES: CounterVec = register_counter_vec!(
        "coordinator_nonce_refreshes_total",
        "Sequence cache refreshes from chain",
        &["kind"]
    ).unwrap();

    // Tracker
    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "coordinator_consecutive_failures",
        "Number of consecutive failures (circuit breaker)",
        &["component"]
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "coordinator_last_successful_poll_timestamp",
        "Unix timestamp of last successful poll",
        &["component"]
    ).unwrap();

    pub static ref NOTIFICATION_FAILURES: CounterVec = register_counter_vec!(
        "coordinator_notification_failures_total",
        "Notification deliveries that failed",
        &["sink"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "coordinator_up",
        "Whether the coordinator is up and running"
    ).unwrap();
}

/// Record the final outcome of a transfer request
pub fn record_transfer(outcome: &str) {
    TRANSFERS_INITIATED.with_label_values(&[outcome]).inc();
}

/// Record a relay call result and, for final answers, the total latency
pub fn record_relay_attempt(result: &str) {
    RELAY_ATTEMPTS.with_label_values(&[result]).inc();
}

pub fn record_relay_latency(result: &str, seconds: f64) {
    RELAY_LATENCY.with_label_values(&[result]).observe(seconds);
}

/// Update consecutive failures (circuit breaker)
pub fn set_consecutive_failures(component: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[component])
        .set(count as f64);
}

/// Record last successful poll
pub fn record_successful_poll(component: &str) {
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[component])
        .set(chrono::Utc::now().timestamp() as f64);
}

/// Render the default registry in the text exposition format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        record_transfer("committed");
        UP.set(1.0);
        let text = gather_text();
        assert!(text.contains("coordinator_transfers_initiated_total"));
        assert!(text.contains("coordinator_up"));
    }
}
