//! WebSocket connection handler
//!
//! One task per socket at `/ws`. Lifecycle: `ACCEPTED` (a `connected` frame
//! goes out immediately) → `BOUND` after the first handshake → `CLOSED`.
//! Inbound frames are admitted through the per-session rate limiter and then
//! dispatched; outbound traffic flows through a bounded queue whose overflow
//! closes the socket rather than backing it up.
//!
//! Failure posture: parse errors, store failures, and GeoIP misses degrade
//! to warnings and null fields. Only bans, termination, supersession, idle
//! timeout, and slow consumers close the connection from our side.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::geoip::GeoInfo;
use crate::limiter::DenyReason;
use crate::protocol::{
    command_frame, connected_frame, now_ms, parse_frame, ping_frame, CommandEnvelope,
    CommandStatus, HandshakeMetadata, InboundFrame,
};
use crate::registry::{BindError, OutboundHandle, SessionMeta, SessionMode};
use crate::sink::normalize_event;
use crate::store::{CommandAudit, WriteOp};

/// Close reason sent when the limiter bans a session mid-connection.
const BAN_TERMINATE_REASON: &str = "Too many requests - temporarily banned";

/// Per-connection state owned by the reader task.
struct ConnState {
    connection_id: String,
    peer_ip: IpAddr,
    session_hash: Option<String>,
    geo: GeoInfo,
    handle: Arc<OutboundHandle>,
    last_risk: Option<u8>,
}

enum Flow {
    Continue,
    Close,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let connection_id = format!("c-{}", Uuid::new_v4().simple());
    let (sender, mut receiver) = socket.split();
    let (handle, frames_rx, close_rx) = OutboundHandle::channel();

    state.connection_opened();
    state
        .registry
        .register_connection(&connection_id, addr.ip(), handle.clone());

    let send_task = tokio::spawn(run_send_loop(sender, frames_rx, close_rx.clone()));
    let keepalive_task = tokio::spawn(run_keepalive(
        handle.clone(),
        Duration::from_millis(state.config.ws.ping_interval_ms),
    ));

    // Accept: the connection id goes out before anything else.
    let _ = handle.try_send_frame(connected_frame(&connection_id, now_ms()));
    debug!(target: "ws", conn = %connection_id, peer = %addr, "connection accepted");

    let mut conn = ConnState {
        connection_id: connection_id.clone(),
        peer_ip: addr.ip(),
        session_hash: None,
        geo: GeoInfo::default(),
        handle: handle.clone(),
        last_risk: None,
    };

    let idle_timeout = Duration::from_millis(state.config.ws.idle_timeout_ms);
    let mut reader_close = close_rx;
    loop {
        tokio::select! {
            next = tokio::time::timeout(idle_timeout, receiver.next()) => {
                match next {
                    Err(_) => {
                        debug!(target: "ws", conn = %connection_id, "idle timeout");
                        handle.close("idle_timeout");
                        break;
                    }
                    Ok(None) | Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(message))) => match message {
                        Message::Text(text) => {
                            if matches!(handle_text(&state, &mut conn, &text).await, Flow::Close) {
                                break;
                            }
                        }
                        Message::Ping(_) | Message::Pong(_) => {
                            state.registry.touch_connection(&connection_id, 0);
                        }
                        Message::Binary(_) => {
                            warn!(target: "ws", conn = %connection_id, "dropping binary frame");
                        }
                        Message::Close(_) => break,
                    },
                }
            }
            _ = reader_close.changed() => break,
        }
    }

    // Teardown. Only the bound connection marks the session disconnected;
    // a superseded socket must not clobber its successor.
    keepalive_task.abort();
    if let Some(hash) = state.registry.unbind(&connection_id) {
        state.bus.forget(&hash).await;
        state.writer.enqueue(WriteOp::SetConnected {
            session_hash: hash,
            connected: false,
            retry: true,
        });
    }
    state.registry.remove_connection(&connection_id);
    state.connection_closed();

    drop(handle);
    drop(conn);
    let _ = send_task.await;
    debug!(target: "ws", conn = %connection_id, "connection closed");
}

/// Writer half: drains the bounded outbound queue onto the socket. On a
/// close signal the queue is flushed first so a final TERMINATE still
/// reaches the client, then a close frame carries the reason.
async fn run_send_loop(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut frames_rx: mpsc::Receiver<String>,
    mut close_rx: watch::Receiver<Option<&'static str>>,
) {
    let mut close_reason: Option<&'static str> = None;
    loop {
        tokio::select! {
            frame = frames_rx.recv() => match frame {
                Some(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            changed = close_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                close_reason = *close_rx.borrow();
                if close_reason.is_some() {
                    break;
                }
            }
        }
    }

    while let Ok(text) = frames_rx.try_recv() {
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    if let Some(reason) = close_reason {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code(reason),
                reason: reason.into(),
            })))
            .await;
    }
}

fn close_code(reason: &str) -> u16 {
    match reason {
        "idle_timeout" => 1000,
        _ => 1008,
    }
}

/// Keepalive: a ping frame through the same bounded queue as everything
/// else. A queue too full to take a ping is a slow consumer.
async fn run_keepalive(handle: Arc<OutboundHandle>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // immediate first tick
    loop {
        ticker.tick().await;
        if handle.is_closed() {
            return;
        }
        if handle.try_send_frame(ping_frame(now_ms())).is_err() {
            if !handle.is_closed() {
                handle.close("slow_consumer");
            }
            return;
        }
    }
}

/// The session hash a frame itself names, if any.
fn frame_session_hash(frame: &InboundFrame) -> Option<&str> {
    match frame {
        InboundFrame::Handshake { session_hash, .. } => Some(session_hash),
        InboundFrame::Batch { session_hash, .. } => Some(session_hash),
        InboundFrame::Single { session_hash, .. } => session_hash.as_deref(),
        InboundFrame::Pong | InboundFrame::CommandAck { .. } => None,
    }
}

async fn handle_text(state: &Arc<AppState>, conn: &mut ConnState, text: &str) -> Flow {
    state.registry.touch_connection(&conn.connection_id, 0);

    if text.len() > state.config.ws.max_frame_bytes {
        warn!(target: "ws", conn = %conn.connection_id, bytes = text.len(), "dropping oversized frame");
        return Flow::Continue;
    }

    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(target: "ws", conn = %conn.connection_id, %err, "dropping unparseable frame");
            return Flow::Continue;
        }
    };

    // The principal this frame acts for: the hash it names, else the bound
    // session. A frame naming neither on an unbound connection is noise.
    let principal = frame_session_hash(&frame)
        .map(str::to_string)
        .or_else(|| conn.session_hash.clone());
    let Some(ref principal_hash) = principal else {
        if conn.session_hash.is_none() {
            debug!(target: "ws", conn = %conn.connection_id, "dropping frame before handshake");
        }
        return Flow::Continue;
    };

    // Terminated sessions are deaf: inbound traffic is ignored outright.
    if state.registry.is_terminated(principal_hash) {
        return Flow::Continue;
    }

    // Admission happens before any work, keyed by the session when the
    // frame names one. A banned session is cut off here even on a fresh
    // handshake from a new connection.
    let admission = state.limiter.admit(principal_hash, 1);
    if !admission.allowed {
        return match admission.reason {
            Some(DenyReason::Banned) => {
                let command = CommandEnvelope::terminate(BAN_TERMINATE_REASON);
                let _ = conn.handle.try_send_frame(command_frame(&command));
                conn.handle.close("banned");
                info!(target: "ws", conn = %conn.connection_id, session = %principal_hash, "banned session disconnected");
                Flow::Close
            }
            _ => {
                on_rate_limited(state, conn, principal_hash).await;
                Flow::Continue
            }
        };
    }

    dispatch(state, conn, frame).await
}

/// A denied frame is dropped; sustained violation pressure additionally
/// downspins the session through the command bus, de-bounced per session.
async fn on_rate_limited(state: &Arc<AppState>, conn: &mut ConnState, hash: &str) {
    let stats = state.limiter.violation_stats(hash);
    let hash = hash.to_string();

    state.registry.increment_violations(&hash);
    state.writer.enqueue(WriteOp::IncrementViolations {
        session_hash: hash.clone(),
    });
    state.writer.enqueue(WriteOp::Violation {
        session_hash: hash.clone(),
        ip_address: Some(conn.peer_ip.to_string()),
        violation_count: stats.count,
    });

    if !(stats.should_throttle
        && state.config.limiter.auto_throttle
        && state.registry.auto_throttle_allowed(&hash))
    {
        return;
    }

    let latency_ms = state.config.limiter.throttle_latency_ms;
    match state
        .registry
        .transition(&hash, SessionMode::Downspin, latency_ms)
    {
        Ok(snapshot) => {
            state.writer.enqueue(WriteOp::SetMode {
                session_hash: hash.clone(),
                mode: snapshot.mode,
                latency_ms: snapshot.current_latency_ms,
            });
            let command = CommandEnvelope::set_latency(latency_ms);
            let audit = CommandAudit::new(
                &command.id,
                &hash,
                command.command_type,
                command.payload.clone(),
                "auto-throttle",
                "",
            );
            state.writer.enqueue(WriteOp::LogCommand(audit));
            state.bus.publish(&hash, &command).await;
            info!(
                target: "ws",
                session = %hash,
                eps = stats.events_per_second,
                violations = stats.count,
                "auto-throttle engaged"
            );
        }
        Err(_) => {
            // Already terminated; nothing to throttle.
        }
    }
}

async fn dispatch(state: &Arc<AppState>, conn: &mut ConnState, frame: InboundFrame) -> Flow {
    match frame {
        InboundFrame::Handshake {
            session_hash,
            metadata,
        } => handle_handshake(state, conn, session_hash, metadata).await,
        InboundFrame::Batch {
            session_hash,
            events,
        } => {
            ingest_events(state, conn, &session_hash, &events);
            Flow::Continue
        }
        InboundFrame::Single {
            session_hash,
            event,
        } => {
            let hash = match session_hash.or_else(|| conn.session_hash.clone()) {
                Some(hash) => hash,
                None => return Flow::Continue,
            };
            ingest_events(state, conn, &hash, std::slice::from_ref(&event));
            Flow::Continue
        }
        InboundFrame::CommandAck { command_id, result } => {
            let error_message = result
                .as_ref()
                .and_then(|r| r.get("error"))
                .filter(|e| !e.is_null())
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()));
            let status = if error_message.is_some() {
                CommandStatus::Failed
            } else {
                CommandStatus::Acknowledged
            };
            state.writer.enqueue(WriteOp::UpdateCommandStatus {
                command_id,
                status,
                error_message,
            });
            Flow::Continue
        }
        InboundFrame::Pong => Flow::Continue,
    }
}

async fn handle_handshake(
    state: &Arc<AppState>,
    conn: &mut ConnState,
    session_hash: String,
    metadata: HandshakeMetadata,
) -> Flow {
    // A re-handshake under a different hash releases the old binding first.
    if let Some(old) = conn.session_hash.clone() {
        if old != session_hash {
            state.registry.unbind(&conn.connection_id);
            state.bus.forget(&old).await;
        }
    }

    let geo = state.geoip.lookup(conn.peer_ip);
    let meta = SessionMeta::from_handshake(conn.peer_ip, &metadata, geo.clone());

    match state.registry.bind(
        &conn.connection_id,
        &session_hash,
        meta.clone(),
        conn.handle.clone(),
    ) {
        Ok(_) => {
            conn.geo = geo;
            conn.session_hash = Some(session_hash.clone());
            state.writer.enqueue(WriteOp::UpsertSession {
                session_hash: session_hash.clone(),
                meta,
            });
            state.bus.track(&session_hash).await;
            info!(
                target: "ws",
                conn = %conn.connection_id,
                session = %session_hash,
                country = conn.geo.country_code.as_deref().unwrap_or("-"),
                "session bound"
            );
            Flow::Continue
        }
        Err(BindError::Terminated) => {
            debug!(target: "ws", session = %session_hash, "rejecting handshake for terminated session");
            conn.handle.close("terminated");
            Flow::Close
        }
    }
}

/// Stamp, normalize, and enqueue a slice of raw events, then refresh the
/// session counters and risk score.
fn ingest_events(state: &Arc<AppState>, conn: &mut ConnState, hash: &str, events: &[Value]) {
    let (risk, is_bot) = state.limiter.risk_score(hash);
    for raw in events {
        let normalized = normalize_event(raw, hash, Some(conn.peer_ip), &conn.geo, Some(risk));
        state.sink.enqueue(normalized);
    }

    let delta = events.len() as u64;
    state.registry.touch(hash, delta);
    state.registry.touch_connection(&conn.connection_id, delta);
    state.writer.enqueue(WriteOp::IncrementEventCount {
        session_hash: hash.to_string(),
        delta,
    });

    if conn.last_risk != Some(risk) {
        conn.last_risk = Some(risk);
        state.registry.set_risk(hash, risk, is_bot);
        state.writer.enqueue(WriteOp::SetRisk {
            session_hash: hash.to_string(),
            risk_score: risk,
            is_bot,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(close_code("idle_timeout"), 1000);
        assert_eq!(close_code("banned"), 1008);
        assert_eq!(close_code("slow_consumer"), 1008);
        assert_eq!(close_code("superseded"), 1008);
        assert_eq!(close_code("terminated"), 1008);
    }
}
