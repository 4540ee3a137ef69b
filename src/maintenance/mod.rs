//! Background maintenance
//!
//! Periodic housekeeping driven off one task: dashboard snapshot refresh,
//! stale session purges (durable and in-memory), and limiter eviction / ban
//! expiry. Every pass is idempotent and safe to run concurrently with
//! traffic; failures are swallowed and logged.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::protocol::now_ms;
use crate::server::AppState;

/// Dashboard snapshot refresh cadence.
const STATS_REFRESH: Duration = Duration::from_secs(60);
/// Limiter eviction / ban purge cadence.
const LIMITER_SWEEP: Duration = Duration::from_secs(300);
/// Stale session purge cadence.
const SESSION_PURGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Disconnected sessions older than this leave the durable store.
const SESSION_RETENTION_DAYS: u32 = 7;
/// Disconnected sessions idle this long leave the in-memory registry.
const REGISTRY_IDLE: Duration = Duration::from_secs(60 * 60);

/// Run all maintenance loops until shutdown.
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut stats_tick = tokio::time::interval(STATS_REFRESH);
    let mut sweep_tick = tokio::time::interval(LIMITER_SWEEP);
    let mut purge_tick = tokio::time::interval(SESSION_PURGE);
    // Skip the immediate first firing of the slow ones.
    sweep_tick.tick().await;
    purge_tick.tick().await;

    loop {
        tokio::select! {
            _ = stats_tick.tick() => refresh_dashboard(&state).await,
            _ = sweep_tick.tick() => sweep_limiter(&state),
            _ = purge_tick.tick() => purge_sessions(&state).await,
            _ = shutdown.changed() => break,
        }
    }
    debug!(target: "server", "maintenance stopped");
}

/// Rebuild the aggregated dashboard snapshot and persist it best-effort.
async fn refresh_dashboard(state: &AppState) {
    let online = state.bus.online_count().await;
    let limiter = state.limiter.stats();
    let sink = state.sink.stats();
    let snapshot = json!({
        "refreshedAt": now_ms(),
        "online": online,
        "sessionsTracked": state.registry.session_count(),
        "sessionsConnected": state.registry.connected_count(),
        "connections": {
            "total": state.total_connections(),
            "active": state.active_connections(),
        },
        "rateLimiter": limiter,
        "eventSink": sink,
        "uptimeSecs": state.uptime_secs(),
    });

    *state.dashboard.write() = Some(snapshot.clone());
    state.sessions.upsert_dashboard_stats(&snapshot).await;
}

/// Evict idle limiter entries and drop expired bans.
fn sweep_limiter(state: &AppState) {
    let evicted = state
        .limiter
        .evict_idle(Duration::from_millis(state.config.limiter.inactivity_eviction_ms));
    let purged = state.limiter.purge_expired_bans();
    let registry_evicted = state.registry.evict_disconnected(REGISTRY_IDLE);
    if evicted + purged + registry_evicted > 0 {
        debug!(
            target: "limiter",
            evicted, purged, registry_evicted,
            "maintenance sweep"
        );
    }
}

/// Remove long-disconnected sessions from the durable store.
async fn purge_sessions(state: &AppState) {
    if let Some(removed) = state.sessions.delete_stale_sessions(SESSION_RETENTION_DAYS).await {
        if removed > 0 {
            info!(target: "store", removed, "purged stale sessions");
        }
    }
}
