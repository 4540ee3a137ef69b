//! Command bus
//!
//! Fan-out bridge between the admin API and live connections. Commands are
//! published on the `traffic:commands` topic; each node runs one subscriber
//! that resolves the target session's outbound handle through the registry
//! and enqueues the command frame. Delivery is best-effort: a session with
//! no live connection here is dropped silently (the admin write-through to
//! the store is the audit).
//!
//! Two backends share the contract: Redis pub/sub with a presence hash
//! (`traffic:presence`, session hash → node id) for multi-node deployments,
//! and an in-process broadcast channel for single-node and test runs.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use futures_util::StreamExt;
use redis::AsyncCommands;

use crate::protocol::{command_frame, CommandEnvelope};
use crate::registry::SessionRegistry;
use crate::store::{StoreWriter, WriteOp};

/// Pub/sub topic carrying command envelopes.
pub const COMMAND_TOPIC: &str = "traffic:commands";
/// Presence hash: session hash -> node id.
const PRESENCE_KEY: &str = "traffic:presence";
/// Deadline for a single publish.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);
/// Backoff between subscriber reconnect attempts.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);
/// In-process channel depth.
const MEMORY_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis connect failed: {0}")]
    Connect(String),
}

/// One message on the command topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub session_hash: String,
    pub command: CommandEnvelope,
}

enum Backend {
    Memory {
        tx: broadcast::Sender<String>,
        presence: Mutex<HashSet<String>>,
    },
    Redis {
        client: redis::Client,
        publisher: redis::aio::ConnectionManager,
    },
}

/// Aggregate bus counters for stats surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub backend: &'static str,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// The command bus: publish side, presence index, and subscriber loop.
pub struct CommandBus {
    backend: Backend,
    node_id: String,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl CommandBus {
    /// In-process bus for single-node deployments and tests.
    pub fn in_memory() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_CHANNEL_CAPACITY);
        Self {
            backend: Backend::Memory {
                tx,
                presence: Mutex::new(HashSet::new()),
            },
            node_id: make_node_id(),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Redis-backed bus for multi-node deployments.
    pub async fn connect_redis(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connect(e.to_string()))?;
        let publisher = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        info!(target: "bus", "redis command bus connected");
        Ok(Self {
            backend: Backend::Redis { client, publisher },
            node_id: make_node_id(),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Memory { .. } => "memory",
            Backend::Redis { .. } => "redis",
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish a command for a session. Best-effort and non-blocking past
    /// the publish deadline; failures are logged, never propagated.
    pub async fn publish(&self, session_hash: &str, command: &CommandEnvelope) {
        let message = BusMessage {
            session_hash: session_hash.to_string(),
            command: command.clone(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "bus", %err, "failed to serialize command");
                return;
            }
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        match &self.backend {
            Backend::Memory { tx, .. } => {
                // No receiver just means no subscriber yet; best-effort.
                let _ = tx.send(payload);
            }
            Backend::Redis { publisher, .. } => {
                let mut conn = publisher.clone();
                let result = tokio::time::timeout(PUBLISH_TIMEOUT, async {
                    conn.publish::<_, _, ()>(COMMAND_TOPIC, payload).await
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(target: "bus", %err, "publish failed"),
                    Err(_) => warn!(target: "bus", "publish timed out"),
                }
            }
        }
    }

    /// Record that this node holds the session's connection.
    pub async fn track(&self, session_hash: &str) {
        match &self.backend {
            Backend::Memory { presence, .. } => {
                presence.lock().insert(session_hash.to_string());
            }
            Backend::Redis { publisher, .. } => {
                let mut conn = publisher.clone();
                let result: redis::RedisResult<()> =
                    conn.hset(PRESENCE_KEY, session_hash, &self.node_id).await;
                if let Err(err) = result {
                    warn!(target: "bus", %err, "presence track failed");
                }
            }
        }
    }

    /// Remove the session from the presence index.
    pub async fn forget(&self, session_hash: &str) {
        match &self.backend {
            Backend::Memory { presence, .. } => {
                presence.lock().remove(session_hash);
            }
            Backend::Redis { publisher, .. } => {
                let mut conn = publisher.clone();
                let result: redis::RedisResult<()> = conn.hdel(PRESENCE_KEY, session_hash).await;
                if let Err(err) = result {
                    warn!(target: "bus", %err, "presence forget failed");
                }
            }
        }
    }

    /// Sessions currently online across the deployment. Degrades to 0.
    pub async fn online_count(&self) -> usize {
        match &self.backend {
            Backend::Memory { presence, .. } => presence.lock().len(),
            Backend::Redis { publisher, .. } => {
                let mut conn = publisher.clone();
                match conn.hlen::<_, usize>(PRESENCE_KEY).await {
                    Ok(n) => n,
                    Err(err) => {
                        warn!(target: "bus", %err, "presence count failed");
                        0
                    }
                }
            }
        }
    }

    /// Liveness probe. The in-process backend is always healthy.
    pub async fn healthy(&self) -> bool {
        match &self.backend {
            Backend::Memory { .. } => true,
            Backend::Redis { publisher, .. } => {
                let mut conn = publisher.clone();
                let result = tokio::time::timeout(Duration::from_secs(2), async {
                    redis::cmd("PING").query_async::<String>(&mut conn).await
                })
                .await;
                matches!(result, Ok(Ok(_)))
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            backend: self.backend_name(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Hand one received message to the session's outbound queue. An
    /// overflowing queue closes the connection (slow consumer); a missing
    /// connection drops the command silently.
    fn deliver(&self, registry: &SessionRegistry, writer: &StoreWriter, raw: &str) {
        let message: BusMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(err) => {
                warn!(target: "bus", %err, "dropping malformed bus message");
                return;
            }
        };
        let Some(handle) = registry.deliverer(&message.session_hash, message.command.command_type)
        else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match handle.try_send_frame(command_frame(&message.command)) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                writer.enqueue(WriteOp::UpdateCommandStatus {
                    command_id: message.command.id.clone(),
                    status: crate::protocol::CommandStatus::Sent,
                    error_message: None,
                });
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                handle.close("slow_consumer");
            }
        }
    }
}

fn make_node_id() -> String {
    format!("node-{}", Uuid::new_v4().simple())
}

/// Subscriber loop for this node. Runs until shutdown; the Redis variant
/// reconnects with backoff on connection loss.
pub async fn run_subscriber(
    bus: Arc<CommandBus>,
    registry: Arc<SessionRegistry>,
    writer: StoreWriter,
    mut shutdown: watch::Receiver<bool>,
) {
    match &bus.backend {
        Backend::Memory { tx, .. } => {
            let mut rx = tx.subscribe();
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(raw) => bus.deliver(&registry, &writer, &raw),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "bus", skipped, "subscriber lagged, commands lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }
        Backend::Redis { client, .. } => loop {
            if *shutdown.borrow() {
                break;
            }
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(err) => {
                    warn!(target: "bus", %err, "pubsub connect failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };
            if let Err(err) = pubsub.subscribe(COMMAND_TOPIC).await {
                warn!(target: "bus", %err, "subscribe failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => continue,
                    _ = shutdown.changed() => break,
                }
            }
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    message = stream.next() => match message {
                        Some(msg) => {
                            match msg.get_payload::<String>() {
                                Ok(raw) => bus.deliver(&registry, &writer, &raw),
                                Err(err) => warn!(target: "bus", %err, "bad pubsub payload"),
                            }
                        }
                        // Stream ended: connection lost, fall out to reconnect.
                        None => break,
                    },
                    _ = shutdown.changed() => return,
                }
            }
            debug!(target: "bus", "pubsub stream ended, reconnecting");
        },
    }
    debug!(target: "bus", "command subscriber stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSection;
    use crate::registry::{OutboundHandle, SessionMeta};
    use crate::store::{spawn_writer, EventLogStore, SessionStore};

    const HASH: &str = "abcdef0123456789abcdef0123456789";

    fn test_writer() -> (StoreWriter, tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let section = StoreSection::default();
        let (tx, rx) = watch::channel(false);
        let (writer, worker) = spawn_writer(
            Arc::new(SessionStore::disabled(&section)),
            Arc::new(EventLogStore::disabled(&section)),
            rx,
        );
        (writer, worker, tx)
    }

    #[tokio::test]
    async fn test_memory_publish_reaches_bound_session() {
        let bus = Arc::new(CommandBus::in_memory());
        let registry = Arc::new(SessionRegistry::new());
        let (writer, _worker, _shutdown_store) = test_writer();

        let (handle, mut frames, _close) = OutboundHandle::channel();
        registry.register_connection("c-1", "198.51.100.7".parse().unwrap(), handle.clone());
        registry
            .bind("c-1", HASH, SessionMeta::default(), handle)
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sub = tokio::spawn(run_subscriber(
            bus.clone(),
            registry.clone(),
            writer,
            shutdown_rx,
        ));
        // Give the subscriber a beat to attach before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let command = CommandEnvelope::set_latency(2_000);
        bus.publish(HASH, &command).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("delivery deadline")
            .expect("frame");
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "command");
        assert_eq!(parsed["command"]["type"], "SET_LATENCY");
        assert_eq!(parsed["command"]["payload"]["latency_ms"], 2_000);
        assert_eq!(parsed["command"]["id"], command.id.as_str());

        assert_eq!(bus.stats().delivered, 1);
        shutdown_tx.send(true).unwrap();
        sub.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session_drops_silently() {
        let bus = Arc::new(CommandBus::in_memory());
        let registry = Arc::new(SessionRegistry::new());
        let (writer, _worker, _shutdown_store) = test_writer();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sub = tokio::spawn(run_subscriber(
            bus.clone(),
            registry.clone(),
            writer,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(HASH, &CommandEnvelope::terminate("x")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.stats().dropped, 1);
        assert_eq!(bus.stats().delivered, 0);

        shutdown_tx.send(true).unwrap();
        sub.await.unwrap();
    }

    #[tokio::test]
    async fn test_presence_tracking_memory() {
        let bus = CommandBus::in_memory();
        assert_eq!(bus.online_count().await, 0);
        bus.track(HASH).await;
        bus.track(HASH).await;
        assert_eq!(bus.online_count().await, 1);
        bus.forget(HASH).await;
        assert_eq!(bus.online_count().await, 0);
        assert!(bus.healthy().await);
    }

    #[tokio::test]
    async fn test_per_session_order_preserved() {
        let bus = Arc::new(CommandBus::in_memory());
        let registry = Arc::new(SessionRegistry::new());
        let (writer, _worker, _shutdown_store) = test_writer();

        let (handle, mut frames, _close) = OutboundHandle::channel();
        registry.register_connection("c-1", "198.51.100.7".parse().unwrap(), handle.clone());
        registry
            .bind("c-1", HASH, SessionMeta::default(), handle)
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sub = tokio::spawn(run_subscriber(
            bus.clone(),
            registry.clone(),
            writer,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        for latency in [100u32, 200, 300] {
            bus.publish(HASH, &CommandEnvelope::set_latency(latency)).await;
        }
        for expected in [100u64, 200, 300] {
            let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
                .await
                .unwrap()
                .unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(parsed["command"]["payload"]["latency_ms"], expected);
        }

        shutdown_tx.send(true).unwrap();
        sub.await.unwrap();
    }
}
