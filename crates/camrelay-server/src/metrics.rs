//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if a global
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "relay_ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "relay_ws_disconnections_total";
/// Registered WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "relay_ws_connections_active";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "relay_ws_connection_duration_seconds";
/// Forced removals (counter, labels: reason).
pub const WS_EVICTIONS_TOTAL: &str = "relay_ws_evictions_total";
/// Webhook events received (counter).
pub const WEBHOOK_EVENTS_TOTAL: &str = "relay_webhook_events_total";
/// Messages accepted by subscriber queues (counter).
pub const BROADCAST_DELIVERIES_TOTAL: &str = "relay_broadcast_deliveries_total";
/// Host probes run (counter, labels: outcome).
pub const PROBE_REQUESTS_TOTAL: &str = "relay_probe_requests_total";
/// Host probe wall-clock duration (histogram).
pub const PROBE_DURATION_SECONDS: &str = "relay_probe_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_EVICTIONS_TOTAL,
            WEBHOOK_EVENTS_TOTAL,
            BROADCAST_DELIVERIES_TOTAL,
            PROBE_REQUESTS_TOTAL,
            PROBE_DURATION_SECONDS,
        ];
        for name in names {
            assert!(name.starts_with("relay_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
