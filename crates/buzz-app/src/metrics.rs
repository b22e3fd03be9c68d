//! Metrics collection and export for MQTTBuzz.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use mqttbuzz_core::SessionEvent;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTS_TOTAL: &str = "mqttbuzz_connects_total";
    pub const CONNECT_FAILURES_TOTAL: &str = "mqttbuzz_connect_failures_total";
    pub const DISCONNECTS_TOTAL: &str = "mqttbuzz_disconnects_total";
    pub const MESSAGES_FORWARDED_TOTAL: &str = "mqttbuzz_messages_forwarded_total";
    pub const SESSIONS_LIVE: &str = "mqttbuzz_sessions_live";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::CONNECTS_TOTAL, "Successful broker connections");
    metrics::describe_counter!(
        names::CONNECT_FAILURES_TOTAL,
        "Broker connection attempts that failed"
    );
    metrics::describe_counter!(
        names::DISCONNECTS_TOTAL,
        "Disconnections, by whether they were requested"
    );
    metrics::describe_counter!(
        names::MESSAGES_FORWARDED_TOTAL,
        "Messages that passed their endpoint filter"
    );
    metrics::describe_gauge!(names::SESSIONS_LIVE, "Current number of live sessions");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record one session event.
pub fn record_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected { .. } => counter!(names::CONNECTS_TOTAL).increment(1),
        SessionEvent::ConnectFailed { .. } => {
            counter!(names::CONNECT_FAILURES_TOTAL).increment(1);
        }
        SessionEvent::Disconnected { reason, .. } => {
            let kind = if reason.is_some() { "dropped" } else { "requested" };
            counter!(names::DISCONNECTS_TOTAL, "kind" => kind).increment(1);
        }
        SessionEvent::MessageForwarded { .. } => {
            counter!(names::MESSAGES_FORWARDED_TOTAL).increment(1);
        }
    }
}

/// Update the live session count.
pub fn set_live_sessions(count: usize) {
    gauge!(names::SESSIONS_LIVE).set(count as f64);
}
