//! Prometheus metrics for the fallback transports
//!
//! Mirrors the per-transport statistics into the process-wide registry so an
//! external scraper can follow sends, receipts, errors, and failovers.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, Counter, CounterVec, Encoder,
    GaugeVec, TextEncoder,
};

lazy_static! {
    /// Counter: envelopes handed to a transport successfully
    pub static ref COMMANDS_SENT: CounterVec = register_counter_vec!(
        "mcp_fallback_commands_sent_total",
        "Envelopes sent per transport",
        &["transport"]
    )
    .expect("Failed to create commands_sent metric");

    /// Counter: envelopes received by a transport (expired ones included)
    pub static ref COMMANDS_RECEIVED: CounterVec = register_counter_vec!(
        "mcp_fallback_commands_received_total",
        "Envelopes received per transport",
        &["transport"]
    )
    .expect("Failed to create commands_received metric");

    /// Counter: errors by transport and kind
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "mcp_fallback_errors_total",
        "Transport errors by kind",
        &["transport", "kind"]
    )
    .expect("Failed to create errors metric");

    /// Counter: active transport switched from one transport to another
    pub static ref FAILOVERS: Counter = register_counter!(
        "mcp_fallback_failovers_total",
        "Number of active transport switches"
    )
    .expect("Failed to create failovers metric");

    /// Counter: retry attempts made by the manager
    pub static ref RETRIES: Counter = register_counter!(
        "mcp_fallback_retries_total",
        "Retry attempts after a failed send"
    )
    .expect("Failed to create retries metric");

    /// Gauge: 1 for the active transport, 0 for the rest
    pub static ref ACTIVE_TRANSPORT: GaugeVec = register_gauge_vec!(
        "mcp_fallback_active_transport",
        "Currently active transport (1 = active)",
        &["transport"]
    )
    .expect("Failed to create active_transport metric");
}

/// Record a successful send
pub fn record_sent(transport: &str) {
    COMMANDS_SENT.with_label_values(&[transport]).inc();
}

/// Record a received envelope
pub fn record_received(transport: &str) {
    COMMANDS_RECEIVED.with_label_values(&[transport]).inc();
}

/// Record an error of the given kind
pub fn record_error(transport: &str, kind: &str) {
    ERRORS.with_label_values(&[transport, kind]).inc();
}

/// Record an active transport switch
pub fn record_failover() {
    FAILOVERS.inc();
}

/// Record a retry attempt
pub fn record_retry() {
    RETRIES.inc();
}

/// Flag `active` as the active transport among `transports`
pub fn set_active_transport<'a>(transports: impl IntoIterator<Item = &'a str>, active: Option<&str>) {
    for name in transports {
        let value = if Some(name) == active { 1.0 } else { 0.0 };
        ACTIVE_TRANSPORT.with_label_values(&[name]).set(value);
    }
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        record_sent("test_transport");
        record_received("test_transport");
        record_error("test_transport", "delivery");
        record_failover();
        record_retry();
        set_active_transport(["test_transport", "other"], Some("test_transport"));

        let output = encode_metrics();
        assert!(output.contains("mcp_fallback_commands_sent_total"));
        assert!(output.contains("mcp_fallback_errors_total"));
        assert!(output.contains("mcp_fallback_active_transport"));
    }
}
