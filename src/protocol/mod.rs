//! Wire protocol
//!
//! JSON text frames over a persistent WebSocket, one logical message per
//! frame. Inbound frames are parsed leniently (a malformed frame is dropped,
//! never fatal to the connection); outbound command types are a closed tagged
//! variant, so an unknown command can never be constructed server-side.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Session hash constraints: lowercase hex, 16..=64 chars.
const SESSION_HASH_MIN: usize = 16;
const SESSION_HASH_MAX: usize = 64;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Remote command types understood by the client SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    SetLatency,
    Terminate,
    ToastAlert,
    Redirect,
    RefreshPage,
    ClearStorage,
    LogMessage,
    UpdateConfig,
    CustomEvent,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetLatency => "SET_LATENCY",
            Self::Terminate => "TERMINATE",
            Self::ToastAlert => "TOAST_ALERT",
            Self::Redirect => "REDIRECT",
            Self::RefreshPage => "REFRESH_PAGE",
            Self::ClearStorage => "CLEAR_STORAGE",
            Self::LogMessage => "LOG_MESSAGE",
            Self::UpdateConfig => "UPDATE_CONFIG",
            Self::CustomEvent => "CUSTOM_EVENT",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a command, as recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }
}

/// The unit of outbound control traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: Value,
}

impl CommandEnvelope {
    pub fn new(command_type: CommandType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command_type,
            payload,
        }
    }

    pub fn set_latency(latency_ms: u32) -> Self {
        Self::new(CommandType::SetLatency, json!({ "latency_ms": latency_ms }))
    }

    pub fn terminate(reason: &str) -> Self {
        Self::new(CommandType::Terminate, json!({ "reason": reason }))
    }

    pub fn toast_alert(message: &str, kind: &str, duration_ms: u64) -> Self {
        Self::new(
            CommandType::ToastAlert,
            json!({ "message": message, "type": kind, "duration": duration_ms }),
        )
    }

    pub fn redirect(url: &str, new_tab: bool) -> Self {
        Self::new(
            CommandType::Redirect,
            json!({ "url": url, "newTab": new_tab }),
        )
    }

    pub fn refresh_page(delay_ms: u64) -> Self {
        Self::new(CommandType::RefreshPage, json!({ "delay": delay_ms }))
    }

    pub fn clear_storage(types: &[&str]) -> Self {
        Self::new(CommandType::ClearStorage, json!({ "types": types }))
    }

    pub fn log_message(level: &str, message: &str) -> Self {
        Self::new(
            CommandType::LogMessage,
            json!({ "level": level, "message": message }),
        )
    }

    pub fn update_config(config: Value) -> Self {
        Self::new(CommandType::UpdateConfig, config)
    }

    pub fn custom_event(event_name: &str, detail: Value) -> Self {
        Self::new(
            CommandType::CustomEvent,
            json!({ "eventName": event_name, "detail": detail }),
        )
    }
}

/// Device metadata supplied with a handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandshakeMetadata {
    pub user_agent: Option<String>,
    pub page_url: Option<String>,
    pub referrer: Option<String>,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub timezone: Option<String>,
    pub network_type: Option<String>,
    pub battery_level: Option<f64>,
    pub timestamp: Option<i64>,
}

/// A parsed client → server frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Handshake {
        session_hash: String,
        metadata: HandshakeMetadata,
    },
    Batch {
        session_hash: String,
        events: Vec<Value>,
    },
    /// `event` or `interaction`: the frame itself is the event record.
    Single {
        session_hash: Option<String>,
        event: Value,
    },
    Pong,
    CommandAck {
        command_id: String,
        result: Option<Value>,
    },
}

/// Frame parse failures. All are protocol errors: logged, frame dropped,
/// connection survives.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("frame has no type field")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("frame missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid session hash")]
    BadSessionHash,
}

/// Check the session-hash alphabet and length without allocating.
pub fn is_valid_session_hash(hash: &str) -> bool {
    (SESSION_HASH_MIN..=SESSION_HASH_MAX).contains(&hash.len())
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn required_hash(value: &Value) -> Result<String, FrameError> {
    let hash = value
        .get("sessionHash")
        .and_then(|v| v.as_str())
        .ok_or(FrameError::MissingField("sessionHash"))?;
    if !is_valid_session_hash(hash) {
        return Err(FrameError::BadSessionHash);
    }
    Ok(hash.to_string())
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
    let frame_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(FrameError::MissingType)?;

    match frame_type {
        "handshake" => {
            let session_hash = required_hash(&value)?;
            let metadata = value
                .get("metadata")
                .cloned()
                .map(|m| serde_json::from_value(m).unwrap_or_default())
                .unwrap_or_default();
            Ok(InboundFrame::Handshake {
                session_hash,
                metadata,
            })
        }
        "batch" => {
            let session_hash = required_hash(&value)?;
            let events = value
                .get("events")
                .and_then(|v| v.as_array())
                .cloned()
                .ok_or(FrameError::MissingField("events"))?;
            Ok(InboundFrame::Batch {
                session_hash,
                events,
            })
        }
        "event" | "interaction" => {
            let session_hash = value
                .get("sessionHash")
                .and_then(|v| v.as_str())
                .filter(|h| is_valid_session_hash(h))
                .map(|h| h.to_string());
            Ok(InboundFrame::Single {
                session_hash,
                event: value,
            })
        }
        "pong" => Ok(InboundFrame::Pong),
        "command_ack" => {
            let command_id = value
                .get("commandId")
                .and_then(|v| v.as_str())
                .ok_or(FrameError::MissingField("commandId"))?
                .to_string();
            Ok(InboundFrame::CommandAck {
                command_id,
                result: value.get("result").cloned(),
            })
        }
        other => Err(FrameError::UnknownType(other.to_string())),
    }
}

/// `{type:"connected"}` frame sent immediately after socket accept.
pub fn connected_frame(connection_id: &str, timestamp_ms: i64) -> String {
    json!({
        "type": "connected",
        "connectionId": connection_id,
        "timestamp": timestamp_ms,
    })
    .to_string()
}

/// Keepalive ping frame.
pub fn ping_frame(timestamp_ms: i64) -> String {
    json!({ "type": "ping", "timestamp": timestamp_ms }).to_string()
}

/// Outbound command frame wrapping an envelope.
pub fn command_frame(command: &CommandEnvelope) -> String {
    json!({ "type": "command", "command": command }).to_string()
}
