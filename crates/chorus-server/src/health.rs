//! `/health` endpoint body.

use std::time::Instant;

use chorus_core::{InstanceId, Sequence};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when the log cannot be read.
    pub status: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub parked_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_sequence: Option<Sequence>,
    pub instance_id: InstanceId,
}

pub fn health_check(
    start_time: Instant,
    connections: usize,
    parked_sessions: usize,
    head_sequence: Option<Sequence>,
    instance_id: InstanceId,
) -> HealthResponse {
    HealthResponse {
        status: if head_sequence.is_some() { "ok" } else { "degraded" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        parked_sessions,
        head_sequence,
        instance_id,
    }
}
