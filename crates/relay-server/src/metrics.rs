//! Metrics collection and export for live-relay.
//!
//! Uses the `metrics` crate for instrumentation and exports to Prometheus
//! format. Engine events reach the recorder through [`MetricsSink`].

use anyhow::{Context, Result};
use live_relay_core::{EventSink, RelayEvent};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SOCKETS_TOTAL: &str = "live_relay_sockets_total";
    pub const SOCKETS_ACTIVE: &str = "live_relay_sockets_active";
    pub const MEMBERS_ACTIVE: &str = "live_relay_members_active";
    pub const BROADCASTS_TOTAL: &str = "live_relay_broadcasts_total";
    pub const MERGE_FAILURES_TOTAL: &str = "live_relay_merge_failures_total";
    pub const SEND_FAILURES_TOTAL: &str = "live_relay_send_failures_total";
    pub const SESSIONS_ENDED_TOTAL: &str = "live_relay_sessions_ended_total";
    pub const ERRORS_TOTAL: &str = "live_relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SOCKETS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(names::SOCKETS_ACTIVE, "Current number of open WebSockets");
    metrics::describe_gauge!(
        names::MEMBERS_ACTIVE,
        "Current number of connections registered on a topic"
    );
    metrics::describe_counter!(
        names::BROADCASTS_TOTAL,
        "Total number of updates queued for delivery"
    );
    metrics::describe_counter!(
        names::MERGE_FAILURES_TOTAL,
        "Total number of updates rejected by the merge function"
    );
    metrics::describe_counter!(
        names::SEND_FAILURES_TOTAL,
        "Total number of deliveries that evicted a connection"
    );
    metrics::describe_counter!(names::SESSIONS_ENDED_TOTAL, "Sessions ended, by outcome");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus exporter on `0.0.0.0:port`.
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

/// Record how a session ended.
pub fn record_session_end(outcome: &'static str) {
    counter!(names::SESSIONS_ENDED_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Forwards engine events to the metrics recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn emit(&self, event: &RelayEvent) {
        match event {
            RelayEvent::ConnectionRegistered { .. } => {
                gauge!(names::MEMBERS_ACTIVE).increment(1.0);
            }
            RelayEvent::ConnectionUnregistered { .. } => {
                gauge!(names::MEMBERS_ACTIVE).decrement(1.0);
            }
            RelayEvent::MergeFailed { .. } => {
                counter!(names::MERGE_FAILURES_TOTAL).increment(1);
            }
            RelayEvent::BroadcastSent { .. } => {
                counter!(names::BROADCASTS_TOTAL).increment(1);
            }
            RelayEvent::BroadcastSendFailed { .. } => {
                counter!(names::SEND_FAILURES_TOTAL).increment(1);
            }
        }
    }
}

/// Counts an open WebSocket until dropped.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SOCKETS_TOTAL).increment(1);
        gauge!(names::SOCKETS_ACTIVE).increment(1.0);
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
        gauge!(names::SOCKETS_ACTIVE).decrement(1.0);
    }
}
