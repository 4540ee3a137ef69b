//! Health endpoint
//!
//! `GET /health` aggregates the liveness of the three external backings
//! (command bus, event log, session store). 200 when all report healthy,
//! 503 otherwise, same body either way. An unconfigured backing counts as
//! healthy; degraded mode is operational by design.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::AppState;
use crate::protocol::now_ms;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub redis: bool,
    pub clickhouse: bool,
    pub postgres: bool,
    pub uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    pub timestamp: i64,
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let (redis, clickhouse, postgres) = tokio::join!(
        state.bus.healthy(),
        state.events.healthy(),
        state.sessions.healthy(),
    );
    let healthy = redis && clickhouse && postgres;
    let body = HealthResponse {
        healthy,
        redis,
        clickhouse,
        postgres,
        uptime: state.uptime_secs(),
        memory: memory_rss_bytes(),
        timestamp: now_ms(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// Resident set size of this process, in bytes.
#[cfg(target_os = "linux")]
pub fn memory_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb_str = rest.trim().trim_end_matches(" kB").trim();
            let kb: u64 = kb_str.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn memory_rss_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_rss_on_linux() {
        let result = memory_rss_bytes();
        #[cfg(target_os = "linux")]
        assert!(result.is_some(), "RSS should be readable on Linux");
        let _ = result;
    }

    #[test]
    fn test_health_response_shape() {
        let body = HealthResponse {
            healthy: true,
            redis: true,
            clickhouse: true,
            postgres: true,
            uptime: 42,
            memory: Some(1024),
            timestamp: 1,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["healthy"], true);
        assert_eq!(v["uptime"], 42);
        assert!(v.get("redis").is_some());
        assert!(v.get("clickhouse").is_some());
        assert!(v.get("postgres").is_some());
    }
}
