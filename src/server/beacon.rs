//! Beacon endpoint
//!
//! `POST /beacon` is the client's last-gasp path (page unload,
//! `navigator.sendBeacon`). It always answers `204 No Content`, including
//! on malformed bodies, and enqueues the carried events after the response
//! is on the wire. Each event names its own session hash; events without a
//! valid one are skipped.

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use super::AppState;
use crate::protocol::is_valid_session_hash;
use crate::sink::normalize_event;

/// Bodies past this size are discarded without parsing.
const MAX_BEACON_BYTES: usize = 1024 * 1024;

pub async fn beacon_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Response {
    let peer_ip = connect_info.map(|ci| ci.0.ip());

    // The enqueue runs after the 204 is produced; the sender never waits on
    // the sink or the stores.
    tokio::spawn(async move {
        ingest_beacon_body(&state, peer_ip, body);
    });

    StatusCode::NO_CONTENT.into_response()
}

fn ingest_beacon_body(
    state: &AppState,
    peer_ip: Option<std::net::IpAddr>,
    body: axum::body::Bytes,
) {
    if body.is_empty() || body.len() > MAX_BEACON_BYTES {
        debug!(target: "sink", bytes = body.len(), "beacon body skipped");
        return;
    }
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            debug!(target: "sink", %err, "beacon body unparseable");
            return;
        }
    };
    let Some(events) = parsed.get("events").and_then(|v| v.as_array()) else {
        return;
    };

    let geo = peer_ip
        .map(|ip| state.geoip.lookup(ip))
        .unwrap_or_default();

    let mut accepted = 0usize;
    for event in events {
        let Some(hash) = event
            .get("sessionHash")
            .and_then(|v| v.as_str())
            .filter(|h| is_valid_session_hash(h))
        else {
            continue;
        };
        let normalized = normalize_event(event, hash, peer_ip, &geo, None);
        if state.sink.enqueue(normalized) {
            accepted += 1;
            state.registry.touch(hash, 1);
            state.writer.enqueue(crate::store::WriteOp::IncrementEventCount {
                session_hash: hash.to_string(),
                delta: 1,
            });
        }
    }
    if accepted > 0 {
        debug!(target: "sink", accepted, "beacon events enqueued");
    }
}
