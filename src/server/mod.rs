//! Server surface
//!
//! The WebSocket ingest endpoint, the admin HTTP API, the beacon endpoint,
//! health, and the shared state handed to every handler.

pub mod admin;
pub mod beacon;
pub mod health;
pub mod ratelimit;
pub mod startup;
pub mod ws;

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bus::CommandBus;
use crate::config::Config;
use crate::geoip::GeoIpResolver;
use crate::limiter::RateLimiter;
use crate::registry::SessionRegistry;
use crate::sink::EventSink;
use crate::store::{EventLogStore, SessionStore, StoreWriter};

/// Everything the handlers share. Owned by the server, passed by `Arc`.
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<SessionRegistry>,
    pub bus: Arc<CommandBus>,
    pub sink: Arc<EventSink>,
    pub sessions: Arc<SessionStore>,
    pub events: Arc<EventLogStore>,
    pub writer: StoreWriter,
    pub geoip: Arc<GeoIpResolver>,
    /// Dashboard snapshot cache, refreshed by background maintenance.
    pub dashboard: RwLock<Option<Value>>,
    pub started_at: Instant,
    total_connections: AtomicU64,
    active_connections: AtomicI64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        limiter: Arc<RateLimiter>,
        registry: Arc<SessionRegistry>,
        bus: Arc<CommandBus>,
        sink: Arc<EventSink>,
        sessions: Arc<SessionStore>,
        events: Arc<EventLogStore>,
        writer: StoreWriter,
        geoip: Arc<GeoIpResolver>,
    ) -> Self {
        Self {
            config,
            limiter,
            registry,
            bus,
            sink,
            sessions,
            events,
            writer,
            geoip,
            dashboard: RwLock::new(None),
            started_at: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed).max(0)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
