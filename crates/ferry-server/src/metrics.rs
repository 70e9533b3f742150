//! Prometheus metrics recorder and metric name constants.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Active WebSocket connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "websocket_connections_active";
/// Total WebSocket connections handled (counter).
pub const CONNECTIONS_TOTAL: &str = "websocket_connections_total";
/// Total messages sent to clients (counter).
pub const MESSAGES_SENT_TOTAL: &str = "websocket_messages_sent_total";
/// Connection lifetime in seconds (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "websocket_connection_duration_seconds";

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at process startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    describe_metrics();
    info!("prometheus metrics recorder installed");
    handle
}

/// Register help text for every exposed series.
pub fn describe_metrics() {
    describe_gauge!(CONNECTIONS_ACTIVE, "Number of active WebSocket connections");
    describe_counter!(
        CONNECTIONS_TOTAL,
        "Total number of WebSocket connections handled"
    );
    describe_counter!(
        MESSAGES_SENT_TOTAL,
        "Total number of WebSocket messages sent to clients"
    );
    describe_histogram!(
        CONNECTION_DURATION_SECONDS,
        "WebSocket connection lifetime in seconds"
    );
}

/// Render Prometheus text exposition from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}
