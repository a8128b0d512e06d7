//! Metrics collection and export for Podium.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use podium_core::HubStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "podium_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "podium_connections_active";
    pub const MESSAGES_TOTAL: &str = "podium_messages_total";
    pub const MESSAGES_BYTES: &str = "podium_messages_bytes";
    pub const TOPICS_ACTIVE: &str = "podium_topics_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "podium_subscriptions_total";
    pub const SLOW_CONSUMER_EVICTIONS: &str = "podium_slow_consumer_evictions";
    pub const SCORE_UPDATES_TOTAL: &str = "podium_score_updates_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "podium_publish_failures_total";
    pub const OUTBOX_PENDING: &str = "podium_outbox_pending";
    pub const HTTP_LATENCY_SECONDS: &str = "podium_http_latency_seconds";
    pub const ERRORS_TOTAL: &str = "podium_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of live connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of live connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Topics with at least one subscriber");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of topic subscription requests"
    );
    metrics::describe_gauge!(
        names::SLOW_CONSUMER_EVICTIONS,
        "Clients dropped because their outbound queue was full"
    );
    metrics::describe_counter!(names::SCORE_UPDATES_TOTAL, "Scores applied");
    metrics::describe_counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "Score events whose append failed and went to the outbox"
    );
    metrics::describe_gauge!(names::OUTBOX_PENDING, "Events waiting in the outbox");
    metrics::describe_histogram!(
        names::HTTP_LATENCY_SECONDS,
        "API request latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a subscription request.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record an applied score.
pub fn record_score_update() {
    counter!(names::SCORE_UPDATES_TOTAL).increment(1);
}

/// Record an event parked in the outbox.
pub fn record_publish_failure() {
    counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
}

/// Update the outbox depth.
pub fn set_outbox_pending(count: usize) {
    gauge!(names::OUTBOX_PENDING).set(count as f64);
}

/// Record API request latency.
pub fn record_http_latency(route: String, seconds: f64) {
    histogram!(names::HTTP_LATENCY_SECONDS, "route" => route).record(seconds);
}

/// Mirror the hub counters.
pub fn set_hub_stats(stats: &HubStats) {
    gauge!(names::TOPICS_ACTIVE).set(stats.topics.len() as f64);
    gauge!(names::SLOW_CONSUMER_EVICTIONS).set(stats.slow_consumer_evictions as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_message(10, "inbound");
        record_error("test");
        set_hub_stats(&HubStats::default());
    }
}
