//! Durable store adapters
//!
//! Two external stores back the in-memory state: Postgres for session
//! metadata, command audit, and dashboard stats (transactional), and
//! ClickHouse for events, command log, and rate-limit violations
//! (append-only time-series). Both are optional; every operation degrades
//! gracefully: a store error is logged and surfaces as `None` / empty,
//! never as a failure of the calling path.
//!
//! Writes are funneled through [`StoreWriter`], a bounded mailbox drained by
//! a single worker task. That gives all writes (and so all writes for any
//! one session hash) a total order without holding registry locks across
//! store awaits.

pub mod clickhouse;
pub mod postgres;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::protocol::{now_ms, CommandStatus, CommandType};
use crate::registry::{SessionMeta, SessionMode};

pub use clickhouse::EventLogStore;
pub use postgres::SessionStore;

/// Mailbox capacity for queued writes. Overflow drops the write (the
/// in-memory registry stays authoritative) rather than backing up sockets.
const WRITE_QUEUE_CAPACITY: usize = 4_096;

/// Delay before the single retry of a disconnect write.
const DISCONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("store timeout")]
    Timeout,
    #[error("{0}")]
    Backend(String),
}

/// Audit row for an issued command.
#[derive(Debug, Clone)]
pub struct CommandAudit {
    pub command_id: String,
    pub session_hash: String,
    pub command_type: CommandType,
    pub payload: Value,
    pub admin_id: String,
    pub admin_ip: String,
    pub status: CommandStatus,
    pub created_at_ms: i64,
}

impl CommandAudit {
    pub fn new(
        command_id: &str,
        session_hash: &str,
        command_type: CommandType,
        payload: Value,
        admin_id: &str,
        admin_ip: &str,
    ) -> Self {
        Self {
            command_id: command_id.to_string(),
            session_hash: session_hash.to_string(),
            command_type,
            payload,
            admin_id: admin_id.to_string(),
            admin_ip: admin_ip.to_string(),
            status: CommandStatus::Pending,
            created_at_ms: now_ms(),
        }
    }
}

/// A queued durable write.
#[derive(Debug)]
pub enum WriteOp {
    UpsertSession {
        session_hash: String,
        meta: SessionMeta,
    },
    SetConnected {
        session_hash: String,
        connected: bool,
        /// One best-effort retry for disconnect marks, so fast disconnect
        /// storms do not silently lose the final state.
        retry: bool,
    },
    IncrementEventCount {
        session_hash: String,
        delta: u64,
    },
    SetMode {
        session_hash: String,
        mode: SessionMode,
        latency_ms: u32,
    },
    SetRisk {
        session_hash: String,
        risk_score: u8,
        is_bot: bool,
    },
    IncrementViolations {
        session_hash: String,
    },
    LogCommand(CommandAudit),
    UpdateCommandStatus {
        command_id: String,
        status: CommandStatus,
        error_message: Option<String>,
    },
    Violation {
        session_hash: String,
        ip_address: Option<String>,
        violation_count: u32,
    },
}

/// Cloneable handle for enqueueing writes.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<WriteOp>,
}

impl StoreWriter {
    /// Enqueue a write. Never blocks; a full mailbox drops the op with a log
    /// line (the registry remains the live source of truth).
    pub fn enqueue(&self, op: WriteOp) {
        if let Err(err) = self.tx.try_send(op) {
            warn!(target: "store", %err, "write mailbox full, dropping durable write");
        }
    }
}

/// Spawn the write worker. Returns the writer handle and the worker task's
/// join handle (awaited during shutdown so queued writes drain).
pub fn spawn_writer(
    sessions: Arc<SessionStore>,
    events: Arc<EventLogStore>,
    mut shutdown: watch::Receiver<bool>,
) -> (StoreWriter, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                op = rx.recv() => match op {
                    Some(op) => apply_write(&sessions, &events, op).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        // Drain whatever is already queued before exiting.
        rx.close();
        while let Some(op) = rx.recv().await {
            apply_write(&sessions, &events, op).await;
        }
        debug!(target: "store", "write worker drained");
    });
    (StoreWriter { tx }, handle)
}

async fn apply_write(sessions: &SessionStore, events: &EventLogStore, op: WriteOp) {
    match op {
        WriteOp::UpsertSession { session_hash, meta } => {
            sessions.upsert_session(&session_hash, &meta).await;
        }
        WriteOp::SetConnected {
            session_hash,
            connected,
            retry,
        } => {
            let first = sessions.set_connected(&session_hash, connected).await;
            if first.is_none() && retry && sessions.is_enabled() {
                tokio::time::sleep(DISCONNECT_RETRY_DELAY).await;
                sessions.set_connected(&session_hash, connected).await;
            }
        }
        WriteOp::IncrementEventCount {
            session_hash,
            delta,
        } => {
            sessions.increment_event_count(&session_hash, delta).await;
        }
        WriteOp::SetMode {
            session_hash,
            mode,
            latency_ms,
        } => {
            sessions.set_mode(&session_hash, mode, latency_ms).await;
        }
        WriteOp::SetRisk {
            session_hash,
            risk_score,
            is_bot,
        } => {
            sessions.set_risk(&session_hash, risk_score, is_bot).await;
        }
        WriteOp::IncrementViolations { session_hash } => {
            sessions.increment_violations(&session_hash).await;
        }
        WriteOp::LogCommand(audit) => {
            sessions.log_command(&audit).await;
            events.append_command_log(&audit).await;
        }
        WriteOp::UpdateCommandStatus {
            command_id,
            status,
            error_message,
        } => {
            sessions
                .update_command_status(&command_id, status, error_message.as_deref())
                .await;
        }
        WriteOp::Violation {
            session_hash,
            ip_address,
            violation_count,
        } => {
            events
                .append_violation(&session_hash, ip_address.as_deref(), violation_count)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSection;

    #[tokio::test]
    async fn test_writer_degrades_without_stores() {
        let section = StoreSection::default();
        let sessions = Arc::new(SessionStore::disabled(&section));
        let events = Arc::new(EventLogStore::disabled(&section));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (writer, worker) = spawn_writer(sessions, events, shutdown_rx);

        // All of these are no-ops against disabled stores; none may panic.
        writer.enqueue(WriteOp::UpsertSession {
            session_hash: "abcdef0123456789".to_string(),
            meta: SessionMeta::default(),
        });
        writer.enqueue(WriteOp::SetConnected {
            session_hash: "abcdef0123456789".to_string(),
            connected: false,
            retry: false,
        });
        writer.enqueue(WriteOp::UpdateCommandStatus {
            command_id: "c-1".to_string(),
            status: CommandStatus::Sent,
            error_message: None,
        });
        drop(writer);
        worker.await.unwrap();
    }
}
