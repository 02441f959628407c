//! Prometheus recorder installation and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

/// Install the Prometheus metrics recorder (global).
///
/// Returns `None` if a recorder is already installed.
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("prometheus metrics recorder installed");
            Some(handle)
        }
        Err(e) => {
            warn!(error = %e, "failed to install metrics recorder");
            None
        }
    }
}

/// A handle whose recorder is not installed globally. Renders empty output;
/// used where a handle is required but nothing is recorded (tests).
pub fn build_detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Metric names shared across crates.
pub mod names {
    /// Submissions committed (counter).
    pub const CHAT_ACCEPTED_TOTAL: &str = "chat_messages_accepted_total";
    /// Submissions resolved as duplicates (counter).
    pub const CHAT_DUPLICATE_TOTAL: &str = "chat_messages_duplicate_total";
    /// Submissions rejected by a storage fault (counter).
    pub const CHAT_INGEST_FAILURES_TOTAL: &str = "chat_ingest_failures_total";
    /// Ingest latency including the storage write (histogram).
    pub const CHAT_INGEST_DURATION_SECONDS: &str = "chat_ingest_duration_seconds";
    /// WebSocket connections opened (counter).
    pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
    /// WebSocket disconnections (counter).
    pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
    /// Live WebSocket connections (gauge).
    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
    /// Broadcast sends dropped on a full client queue (counter).
    pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
    /// Connections resumed from a parked session (counter).
    pub const SESSIONS_RESUMED_TOTAL: &str = "sessions_resumed_total";
    /// Parked sessions discarded by expiry or buffer overflow (counter).
    pub const SESSIONS_EXPIRED_TOTAL: &str = "sessions_expired_total";
    /// Messages replayed to reconnecting clients (counter).
    pub const RECOVERY_REPLAYED_TOTAL: &str = "recovery_replayed_total";
    /// Replays truncated by a storage fault (counter).
    pub const RECOVERY_FAILURES_TOTAL: &str = "recovery_failures_total";
    /// Relay publishes that did not reach the hub (counter).
    pub const RELAY_PUBLISH_FAILURES_TOTAL: &str = "relay_publish_failures_total";
    /// Events received from other instances (counter).
    pub const RELAY_RECEIVED_TOTAL: &str = "relay_received_total";
}
