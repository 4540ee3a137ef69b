//! Session registry
//!
//! In-memory map of live sessions and their connection bindings. This is the
//! live source of truth; durable writes are scheduled through the store
//! worker and may lag or fail without affecting it.
//!
//! Locking: an outer `RwLock` guards the maps, a per-session `RwLock` guards
//! each entry. Neither is ever held across an await point; delivery hands out
//! a cloned outbound handle instead of borrowing into the map.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::geoip::GeoInfo;
use crate::protocol::{now_ms, CommandType, HandshakeMetadata};

/// Capacity of each per-connection outbound frame queue. Overflow closes the
/// socket rather than letting the queue grow.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Shaping mode of a session. `Terminated` is sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Normal,
    Upspin,
    Downspin,
    Terminated,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Upspin => "upspin",
            Self::Downspin => "downspin",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "upspin" => Some(Self::Upspin),
            "downspin" => Some(Self::Downspin),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound frames and the close signal for one socket. This is the only
/// capability the registry and command bus hold on a connection; the socket
/// task itself is never exposed.
#[derive(Debug)]
pub struct OutboundHandle {
    frames: mpsc::Sender<String>,
    close: watch::Sender<Option<&'static str>>,
}

/// Error returned when an outbound queue is full or the socket is gone.
#[derive(Debug, Error)]
#[error("outbound queue overflow")]
pub struct OutboundOverflow;

impl OutboundHandle {
    /// Create a handle plus the receiver halves owned by the socket task.
    pub fn channel() -> (
        Arc<Self>,
        mpsc::Receiver<String>,
        watch::Receiver<Option<&'static str>>,
    ) {
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (close_tx, close_rx) = watch::channel(None);
        (
            Arc::new(Self {
                frames: frames_tx,
                close: close_tx,
            }),
            frames_rx,
            close_rx,
        )
    }

    /// Enqueue a frame without blocking. A full queue is an overflow; the
    /// caller decides whether that closes the connection.
    pub fn try_send_frame(&self, frame: String) -> Result<(), OutboundOverflow> {
        self.frames.try_send(frame).map_err(|_| OutboundOverflow)
    }

    /// Signal the socket task to close with the given reason.
    pub fn close(&self, reason: &'static str) {
        let _ = self.close.send(Some(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// Network and device attributes captured at handshake.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub page_url: Option<String>,
    pub referrer: Option<String>,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub timezone: Option<String>,
    pub network_type: Option<String>,
    pub battery_level: Option<f64>,
    pub geo: GeoInfo,
}

impl SessionMeta {
    pub fn from_handshake(ip: IpAddr, metadata: &HandshakeMetadata, geo: GeoInfo) -> Self {
        Self {
            ip_address: Some(ip),
            user_agent: metadata.user_agent.clone(),
            page_url: metadata.page_url.clone(),
            referrer: metadata.referrer.clone(),
            screen_width: metadata.screen_width,
            screen_height: metadata.screen_height,
            timezone: metadata.timezone.clone(),
            network_type: metadata.network_type.clone(),
            battery_level: metadata.battery_level,
            geo,
        }
    }
}

/// Serializable point-in-time view of a session for admin reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_hash: String,
    pub mode: SessionMode,
    pub current_latency_ms: u32,
    pub total_events: u64,
    pub risk_score: u8,
    pub is_bot: bool,
    pub violation_count: u32,
    pub connected: bool,
    pub first_seen: i64,
    pub last_seen: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
}

struct SessionEntry {
    mode: SessionMode,
    current_latency_ms: u32,
    total_events: u64,
    risk_score: u8,
    is_bot: bool,
    violation_count: u32,
    connected: bool,
    first_seen: i64,
    last_seen: i64,
    meta: SessionMeta,
    bound_connection: Option<String>,
    outbound: Option<Arc<OutboundHandle>>,
    last_auto_throttle: Option<Instant>,
}

impl SessionEntry {
    fn new() -> Self {
        let now = now_ms();
        Self {
            mode: SessionMode::Normal,
            current_latency_ms: 0,
            total_events: 0,
            risk_score: 0,
            is_bot: false,
            violation_count: 0,
            connected: false,
            first_seen: now,
            last_seen: now,
            meta: SessionMeta::default(),
            bound_connection: None,
            outbound: None,
            last_auto_throttle: None,
        }
    }

    fn snapshot(&self, hash: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_hash: hash.to_string(),
            mode: self.mode,
            current_latency_ms: self.current_latency_ms,
            total_events: self.total_events,
            risk_score: self.risk_score,
            is_bot: self.is_bot,
            violation_count: self.violation_count,
            connected: self.connected,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            ip_address: self.meta.ip_address.map(|ip| ip.to_string()),
            country_code: self.meta.geo.country_code.clone(),
            city: self.meta.geo.city.clone(),
            isp: self.meta.geo.isp.clone(),
        }
    }
}

/// Per-socket bookkeeping, keyed by server-generated connection id.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub peer_ip: IpAddr,
    pub session_hash: Option<String>,
    pub connected_at: i64,
    pub last_activity: i64,
    pub event_count: u64,
    /// Outbound capability for this socket, bound or not. Lets shutdown
    /// close every connection, including ones still pre-handshake.
    pub outbound: Arc<OutboundHandle>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("session is terminated")]
    Terminated,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session is terminated")]
    Terminated,
}

type SharedEntry = Arc<RwLock<SessionEntry>>;

/// Filter for snapshot reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotFilter {
    /// Only sessions seen within this window.
    pub active_within: Option<Duration>,
    /// Only sessions with `risk_score > 50` or `is_bot`.
    pub high_risk_only: bool,
}

/// The session registry: live sessions plus connection bookkeeping.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedEntry>>,
    connections: RwLock<HashMap<String, ConnectionInfo>>,
    /// Minimum gap between automatic throttle commands per session.
    auto_throttle_window: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_auto_throttle_window(Duration::from_secs(5))
    }

    pub fn with_auto_throttle_window(window: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            auto_throttle_window: window,
        }
    }

    fn entry(&self, hash: &str) -> SharedEntry {
        if let Some(entry) = self.sessions.read().get(hash) {
            return entry.clone();
        }
        let mut sessions = self.sessions.write();
        sessions
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(SessionEntry::new())))
            .clone()
    }

    fn existing(&self, hash: &str) -> Option<SharedEntry> {
        self.sessions.read().get(hash).cloned()
    }

    // ------------------------------------------------------------------
    // Connection bookkeeping
    // ------------------------------------------------------------------

    pub fn register_connection(
        &self,
        connection_id: &str,
        peer_ip: IpAddr,
        outbound: Arc<OutboundHandle>,
    ) {
        let now = now_ms();
        self.connections.write().insert(
            connection_id.to_string(),
            ConnectionInfo {
                connection_id: connection_id.to_string(),
                peer_ip,
                session_hash: None,
                connected_at: now,
                last_activity: now,
                event_count: 0,
                outbound,
            },
        );
    }

    /// Signal every live socket on this node to close. Used by graceful
    /// shutdown after the listener stops accepting.
    pub fn close_all_connections(&self, reason: &'static str) -> usize {
        let handles: Vec<Arc<OutboundHandle>> = self
            .connections
            .read()
            .values()
            .map(|c| c.outbound.clone())
            .collect();
        for handle in &handles {
            handle.close(reason);
        }
        handles.len()
    }

    pub fn touch_connection(&self, connection_id: &str, events_delta: u64) {
        if let Some(info) = self.connections.write().get_mut(connection_id) {
            info.last_activity = now_ms();
            info.event_count += events_delta;
        }
    }

    pub fn remove_connection(&self, connection_id: &str) {
        self.connections.write().remove(connection_id);
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections.read().get(connection_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    // ------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------

    /// Bind a connection to a session. If another connection currently holds
    /// the session on this node it is detached and told to close
    /// (`"superseded"`) before the new binding takes effect. Terminated
    /// sessions reject binds.
    pub fn bind(
        &self,
        connection_id: &str,
        session_hash: &str,
        meta: SessionMeta,
        handle: Arc<OutboundHandle>,
    ) -> Result<SessionSnapshot, BindError> {
        let entry = self.entry(session_hash);
        let (snapshot, superseded) = {
            let mut state = entry.write();
            if state.mode == SessionMode::Terminated {
                return Err(BindError::Terminated);
            }
            let superseded = match (&state.bound_connection, &state.outbound) {
                (Some(prev), Some(outbound)) if prev != connection_id => {
                    Some((prev.clone(), outbound.clone()))
                }
                _ => None,
            };
            state.connected = true;
            state.bound_connection = Some(connection_id.to_string());
            state.outbound = Some(handle);
            state.last_seen = now_ms();
            state.meta = meta;
            (state.snapshot(session_hash), superseded)
        };

        {
            let mut connections = self.connections.write();
            if let Some((prev_id, _)) = &superseded {
                if let Some(prev) = connections.get_mut(prev_id) {
                    prev.session_hash = None;
                }
            }
            if let Some(info) = connections.get_mut(connection_id) {
                info.session_hash = Some(session_hash.to_string());
                info.last_activity = now_ms();
            }
        }

        if let Some((prev_id, outbound)) = superseded {
            debug!(target: "ws", session_hash, prev = %prev_id, "binding superseded");
            outbound.close("superseded");
        }
        Ok(snapshot)
    }

    /// Detach a connection. Idempotent; only the currently bound connection
    /// marks the session disconnected.
    pub fn unbind(&self, connection_id: &str) -> Option<String> {
        let hash = {
            let connections = self.connections.read();
            connections
                .get(connection_id)
                .and_then(|c| c.session_hash.clone())
        }?;
        let entry = self.existing(&hash)?;
        let mut state = entry.write();
        if state.bound_connection.as_deref() == Some(connection_id) {
            state.connected = false;
            state.bound_connection = None;
            state.outbound = None;
            state.last_seen = now_ms();
            Some(hash)
        } else {
            None
        }
    }

    /// The outbound handle for a session, if one is live. Terminated sessions
    /// accept only the final `TERMINATE` push; everything else is refused so
    /// no further command frames can be enqueued for them.
    pub fn deliverer(
        &self,
        session_hash: &str,
        command_type: CommandType,
    ) -> Option<Arc<OutboundHandle>> {
        let entry = self.existing(session_hash)?;
        let state = entry.read();
        if state.mode == SessionMode::Terminated && command_type != CommandType::Terminate {
            return None;
        }
        state.outbound.clone()
    }

    // ------------------------------------------------------------------
    // Session state machine
    // ------------------------------------------------------------------

    /// Apply a mode transition. `upspin` forces zero latency; `terminated` is
    /// sticky and rejects every later transition.
    pub fn transition(
        &self,
        session_hash: &str,
        mode: SessionMode,
        latency_ms: u32,
    ) -> Result<SessionSnapshot, TransitionError> {
        let entry = self.entry(session_hash);
        let mut state = entry.write();
        if state.mode == SessionMode::Terminated {
            return Err(TransitionError::Terminated);
        }
        state.mode = mode;
        state.current_latency_ms = match mode {
            SessionMode::Upspin => 0,
            SessionMode::Terminated => 0,
            _ => latency_ms,
        };
        state.last_seen = now_ms();
        Ok(state.snapshot(session_hash))
    }

    /// Record ingested events.
    pub fn touch(&self, session_hash: &str, events_delta: u64) {
        let entry = self.entry(session_hash);
        let mut state = entry.write();
        state.total_events += events_delta;
        state.last_seen = now_ms();
    }

    pub fn set_risk(&self, session_hash: &str, risk_score: u8, is_bot: bool) {
        let entry = self.entry(session_hash);
        let mut state = entry.write();
        state.risk_score = risk_score.min(100);
        state.is_bot = is_bot;
    }

    pub fn increment_violations(&self, session_hash: &str) {
        let entry = self.entry(session_hash);
        entry.write().violation_count += 1;
    }

    pub fn is_terminated(&self, session_hash: &str) -> bool {
        self.existing(session_hash)
            .map(|e| e.read().mode == SessionMode::Terminated)
            .unwrap_or(false)
    }

    /// De-bounce gate for automatic throttling: true at most once per window
    /// per session.
    pub fn auto_throttle_allowed(&self, session_hash: &str) -> bool {
        let entry = self.entry(session_hash);
        let mut state = entry.write();
        let now = Instant::now();
        match state.last_auto_throttle {
            Some(prev) if now.duration_since(prev) < self.auto_throttle_window => false,
            _ => {
                state.last_auto_throttle = Some(now);
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    pub fn get(&self, session_hash: &str) -> Option<SessionSnapshot> {
        self.existing(session_hash)
            .map(|e| e.read().snapshot(session_hash))
    }

    pub fn snapshot(&self, filter: SnapshotFilter) -> Vec<SessionSnapshot> {
        let cutoff = filter
            .active_within
            .map(|d| now_ms() - d.as_millis() as i64);
        let entries: Vec<(String, SharedEntry)> = self
            .sessions
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut out = Vec::new();
        for (hash, entry) in entries {
            let snap = entry.read().snapshot(&hash);
            if let Some(cutoff) = cutoff {
                if snap.last_seen < cutoff {
                    continue;
                }
            }
            if filter.high_risk_only && !(snap.is_bot || snap.risk_score > 50) {
                continue;
            }
            out.push(snap);
        }
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn connected_count(&self) -> usize {
        let entries: Vec<SharedEntry> = self.sessions.read().values().cloned().collect();
        entries.iter().filter(|e| e.read().connected).count()
    }

    /// Drop disconnected sessions idle longer than `max_age` from memory.
    /// The durable rows keep the history; this only bounds the live map.
    pub fn evict_disconnected(&self, max_age: Duration) -> usize {
        let cutoff = now_ms() - max_age.as_millis() as i64;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| {
            let state = entry.read();
            state.connected || state.last_seen >= cutoff
        });
        before - sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
