//! Admin HTTP API
//!
//! Authenticated REST surface for operators: session reads, shaping actions
//! (upspin / downspin / terminate), client notifications, analytics, and
//! server stats. Every mutating call persists an audit record and publishes
//! the command on the bus; the response carries the fresh command id so the
//! operator can correlate later acks.
//!
//! Auth is a shared secret in `X-API-Key`, compared in constant time. A
//! missing or wrong key is a `401` before any work happens.

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::AppState;
use crate::protocol::{is_valid_session_hash, now_ms, CommandEnvelope};
use crate::registry::{SessionMode, SnapshotFilter, TransitionError};
use crate::store::{CommandAudit, WriteOp};

/// Default latency applied by `downspin` when the body does not name one.
const DEFAULT_DOWNSPIN_LATENCY_MS: u32 = 2_000;
/// Latency values are clamped to the same bound the event pipeline uses.
const MAX_LATENCY_MS: u32 = 60_000;
/// Default termination reason.
const DEFAULT_TERMINATE_REASON: &str = "Terminated by administrator";

/// Byte-wise comparison without early exit, so the secret's match prefix
/// length is not observable through timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Auth middleware: every `/admin/*` route passes through here first.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(provided, &state.config.admin.api_key) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Build the `/admin` router. The caller nests it under `/admin`.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:hash", get(session_detail))
        .route("/sessions/:hash/upspin", post(upspin_handler))
        .route("/sessions/:hash/downspin", post(downspin_handler))
        .route("/sessions/:hash/terminate", post(terminate_handler))
        .route("/sessions/:hash/notify", post(notify_handler))
        .route("/sessions/:hash/redirect", post(redirect_handler))
        .route("/analytics", get(analytics))
        .route("/high-risk", get(high_risk))
        .route("/stats", get(stats))
        .route("/batch-action", post(batch_action))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// Who issued a command, for the audit trail.
struct AdminContext {
    id: String,
    ip: String,
}

impl AdminContext {
    fn extract(headers: &HeaderMap, connect_info: &Option<ConnectInfo<SocketAddr>>) -> Self {
        let id = headers
            .get("x-admin-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .unwrap_or("admin")
            .to_string();
        let ip = connect_info
            .as_ref()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_default();
        Self { id, ip }
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn check_hash(hash: &str) -> Result<(), Response> {
    if is_valid_session_hash(hash) {
        Ok(())
    } else {
        Err(bad_request("invalid session hash"))
    }
}

/// Lenient body parse: empty bodies become `{}`, malformed JSON is a 400.
fn parse_body(body: &axum::body::Bytes) -> Result<Value, Response> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|_| bad_request("invalid JSON body"))
}

/// A shaping action applied to one session.
#[derive(Debug, Clone)]
enum ShapingAction {
    Upspin,
    Downspin { latency_ms: u32 },
    Terminate { reason: String },
}

impl ShapingAction {
    fn mode(&self) -> SessionMode {
        match self {
            Self::Upspin => SessionMode::Upspin,
            Self::Downspin { .. } => SessionMode::Downspin,
            Self::Terminate { .. } => SessionMode::Terminated,
        }
    }

    fn latency_ms(&self) -> u32 {
        match self {
            Self::Downspin { latency_ms } => *latency_ms,
            _ => 0,
        }
    }

    fn command(&self) -> CommandEnvelope {
        match self {
            Self::Upspin => CommandEnvelope::set_latency(0),
            Self::Downspin { latency_ms } => CommandEnvelope::set_latency(*latency_ms),
            Self::Terminate { reason } => CommandEnvelope::terminate(reason),
        }
    }
}

/// Persist the audit record and fan the command out. The audit write-through
/// is the durable trail even when no connection is live to receive it.
async fn issue_command(state: &AppState, hash: &str, command: &CommandEnvelope, admin: &AdminContext) {
    let audit = CommandAudit::new(
        &command.id,
        hash,
        command.command_type,
        command.payload.clone(),
        &admin.id,
        &admin.ip,
    );
    state.writer.enqueue(WriteOp::LogCommand(audit));
    state.bus.publish(hash, command).await;
}

/// Apply one shaping action: state machine first, then durable write, then
/// command fan-out. A terminated session rejects everything.
async fn apply_shaping(
    state: &AppState,
    hash: &str,
    action: &ShapingAction,
    admin: &AdminContext,
) -> Result<Value, TransitionError> {
    let snapshot = state
        .registry
        .transition(hash, action.mode(), action.latency_ms())?;
    state.writer.enqueue(WriteOp::SetMode {
        session_hash: hash.to_string(),
        mode: snapshot.mode,
        latency_ms: snapshot.current_latency_ms,
    });

    let command = action.command();
    issue_command(state, hash, &command, admin).await;
    info!(
        target: "admin",
        session = hash,
        mode = %snapshot.mode,
        command_id = %command.id,
        admin = %admin.id,
        "shaping action applied"
    );

    Ok(json!({
        "success": true,
        "sessionHash": hash,
        "mode": snapshot.mode,
        "latency_ms": snapshot.current_latency_ms,
        "command": command,
    }))
}

fn terminated_response(hash: &str) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "success": false, "sessionHash": hash, "error": "terminated" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Shaping routes
// ---------------------------------------------------------------------------

async fn upspin_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    _body: axum::body::Bytes,
) -> Response {
    if let Err(resp) = check_hash(&hash) {
        return resp;
    }
    let admin = AdminContext::extract(&headers, &connect_info);
    match apply_shaping(&state, &hash, &ShapingAction::Upspin, &admin).await {
        Ok(body) => Json(body).into_response(),
        Err(TransitionError::Terminated) => terminated_response(&hash),
    }
}

async fn downspin_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Response {
    if let Err(resp) = check_hash(&hash) {
        return resp;
    }
    let parsed = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let latency_ms = match parsed.get("latency_ms") {
        None | Some(Value::Null) => DEFAULT_DOWNSPIN_LATENCY_MS,
        Some(v) => match v.as_u64() {
            Some(ms) => (ms as u32).min(MAX_LATENCY_MS),
            None => return bad_request("latency_ms must be a non-negative number"),
        },
    };
    let admin = AdminContext::extract(&headers, &connect_info);
    match apply_shaping(&state, &hash, &ShapingAction::Downspin { latency_ms }, &admin).await {
        Ok(body) => Json(body).into_response(),
        Err(TransitionError::Terminated) => terminated_response(&hash),
    }
}

async fn terminate_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Response {
    if let Err(resp) = check_hash(&hash) {
        return resp;
    }
    let parsed = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let reason = parsed
        .get("reason")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_TERMINATE_REASON)
        .to_string();
    let admin = AdminContext::extract(&headers, &connect_info);
    match apply_shaping(&state, &hash, &ShapingAction::Terminate { reason }, &admin).await {
        Ok(body) => Json(body).into_response(),
        Err(TransitionError::Terminated) => terminated_response(&hash),
    }
}

// ---------------------------------------------------------------------------
// Notification routes
// ---------------------------------------------------------------------------

async fn notify_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Response {
    if let Err(resp) = check_hash(&hash) {
        return resp;
    }
    let parsed = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(message) = parsed
        .get("message")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    else {
        return bad_request("message is required");
    };
    let kind = parsed
        .get("type")
        .and_then(|v| v.as_str())
        .filter(|k| matches!(*k, "info" | "success" | "warning" | "error"))
        .unwrap_or("info");
    let duration = parsed
        .get("duration")
        .and_then(|v| v.as_u64())
        .unwrap_or(5_000);

    if state.registry.is_terminated(&hash) {
        return terminated_response(&hash);
    }

    let admin = AdminContext::extract(&headers, &connect_info);
    let command = CommandEnvelope::toast_alert(message, kind, duration);
    issue_command(&state, &hash, &command, &admin).await;
    Json(json!({ "success": true, "sessionHash": hash, "command": command })).into_response()
}

async fn redirect_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Response {
    if let Err(resp) = check_hash(&hash) {
        return resp;
    }
    let parsed = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(url) = parsed.get("url").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
        return bad_request("url is required");
    };
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return bad_request("url must be http or https");
    }
    let new_tab = parsed
        .get("newTab")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if state.registry.is_terminated(&hash) {
        return terminated_response(&hash);
    }

    let admin = AdminContext::extract(&headers, &connect_info);
    let command = CommandEnvelope::redirect(url, new_tab);
    issue_command(&state, &hash, &command, &admin).await;
    Json(json!({ "success": true, "sessionHash": hash, "command": command })).into_response()
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchActionBody {
    action: String,
    #[serde(default)]
    session_hashes: Vec<String>,
    #[serde(default)]
    payload: Option<Value>,
}

async fn batch_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Response {
    let parsed = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let request: BatchActionBody = match serde_json::from_value(parsed) {
        Ok(r) => r,
        Err(_) => return bad_request("invalid batch-action body"),
    };

    let payload = request.payload.unwrap_or(json!({}));
    let action = match request.action.as_str() {
        "upspin" => ShapingAction::Upspin,
        "downspin" => ShapingAction::Downspin {
            latency_ms: payload
                .get("latency_ms")
                .and_then(|v| v.as_u64())
                .map(|ms| (ms as u32).min(MAX_LATENCY_MS))
                .unwrap_or(DEFAULT_DOWNSPIN_LATENCY_MS),
        },
        "terminate" => ShapingAction::Terminate {
            reason: payload
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_TERMINATE_REASON)
                .to_string(),
        },
        other => {
            warn!(target: "admin", action = other, "unknown batch action");
            return bad_request("unknown action");
        }
    };
    if request.session_hashes.is_empty() {
        return bad_request("sessionHashes is required");
    }

    let admin = AdminContext::extract(&headers, &connect_info);
    let mut results = Vec::with_capacity(request.session_hashes.len());
    for hash in &request.session_hashes {
        if !is_valid_session_hash(hash) {
            results.push(json!({
                "sessionHash": hash,
                "success": false,
                "error": "invalid session hash",
            }));
            continue;
        }
        match apply_shaping(&state, hash, &action, &admin).await {
            Ok(outcome) => results.push(json!({
                "sessionHash": hash,
                "success": true,
                "commandId": outcome["command"]["id"],
            })),
            Err(TransitionError::Terminated) => results.push(json!({
                "sessionHash": hash,
                "success": false,
                "error": "terminated",
            })),
        }
    }

    Json(json!({
        "success": true,
        "action": request.action,
        "count": results.len(),
        "results": results,
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Read routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    minutes: Option<u32>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let minutes = query.minutes.unwrap_or(30).clamp(1, 1_440);

    // The durable store has history across restarts; the registry covers
    // degraded mode.
    let sessions: Value = match state.sessions.get_active_sessions(minutes).await {
        Some(rows) => json!(rows),
        None => {
            let snaps = state.registry.snapshot(SnapshotFilter {
                active_within: Some(Duration::from_secs(u64::from(minutes) * 60)),
                ..Default::default()
            });
            json!(snaps)
        }
    };
    let count = sessions.as_array().map(|a| a.len()).unwrap_or(0);
    Json(json!({ "success": true, "count": count, "sessions": sessions })).into_response()
}

async fn session_detail(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Response {
    if let Err(resp) = check_hash(&hash) {
        return resp;
    }
    let session: Option<Value> = match state.sessions.get_session(&hash).await {
        Some(row) => Some(json!(row)),
        None => state.registry.get(&hash).map(|snap| json!(snap)),
    };
    let Some(session) = session else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "session not found" })),
        )
            .into_response();
    };

    let timeline = state.events.recent_events(&hash, 50).await;
    let commands: Value = match state.sessions.get_command_history(&hash, 20).await {
        Some(rows) => json!(rows),
        None => json!([]),
    };
    Json(json!({
        "success": true,
        "session": session,
        "timeline": timeline,
        "commands": commands,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct AnalyticsQuery {
    hours: Option<u32>,
}

async fn analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Response {
    let hours = query.hours.unwrap_or(24).clamp(1, 720);
    let (summary, geo_distribution, db_stats) = tokio::join!(
        state.events.summary(hours),
        state.events.geo_distribution(hours),
        state.events.db_stats(),
    );
    let bot_candidates: Value = match state.sessions.get_high_risk_sessions().await {
        Some(rows) => json!(rows),
        None => json!(state.registry.snapshot(SnapshotFilter {
            high_risk_only: true,
            ..Default::default()
        })),
    };
    Json(json!({
        "success": true,
        "summary": summary,
        "geoDistribution": geo_distribution,
        "botCandidates": bot_candidates,
        "dbStats": db_stats,
    }))
    .into_response()
}

async fn high_risk(State(state): State<Arc<AppState>>) -> Response {
    let sessions: Value = match state.sessions.get_high_risk_sessions().await {
        Some(rows) => json!(rows),
        None => json!(state.registry.snapshot(SnapshotFilter {
            high_risk_only: true,
            ..Default::default()
        })),
    };
    let count = sessions.as_array().map(|a| a.len()).unwrap_or(0);
    Json(json!({ "success": true, "count": count, "sessions": sessions })).into_response()
}

async fn stats(State(state): State<Arc<AppState>>) -> Response {
    let online = state.bus.online_count().await;
    // Prefer the durable materialized snapshot; fall back to the in-memory
    // cache maintenance keeps warm.
    let dashboard = match state.sessions.get_dashboard_stats().await {
        Some(stats) => stats,
        None => state.dashboard.read().clone().unwrap_or(Value::Null),
    };
    Json(json!({
        "success": true,
        "websocket": {
            "totalConnections": state.total_connections(),
            "activeConnections": state.active_connections(),
            "rateLimiter": state.limiter.stats(),
        },
        "bus": state.bus.stats(),
        "sink": state.sink.stats(),
        "dashboard": dashboard,
        "online": online,
        "timestamp": now_ms(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
        assert!(!constant_time_eq("ab", "abc"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_shaping_action_shapes() {
        let up = ShapingAction::Upspin;
        assert_eq!(up.mode(), SessionMode::Upspin);
        assert_eq!(up.latency_ms(), 0);
        assert_eq!(up.command().payload["latency_ms"], 0);

        let down = ShapingAction::Downspin { latency_ms: 2_000 };
        assert_eq!(down.mode(), SessionMode::Downspin);
        assert_eq!(down.command().payload["latency_ms"], 2_000);

        let term = ShapingAction::Terminate {
            reason: "bye".to_string(),
        };
        assert_eq!(term.mode(), SessionMode::Terminated);
        assert_eq!(term.command().payload["reason"], "bye");
    }

    #[test]
    fn test_parse_body_lenient_on_empty() {
        assert_eq!(
            parse_body(&axum::body::Bytes::new()).unwrap(),
            json!({})
        );
        assert!(parse_body(&axum::body::Bytes::from_static(b"{bad")).is_err());
    }
}
