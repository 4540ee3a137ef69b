//! Postgres session store adapter
//!
//! Durable session metadata, command audit trail, and the materialized
//! dashboard snapshot. Every operation carries a deadline and degrades to
//! `None` / empty on error; the in-memory registry stays authoritative and
//! the serving path never waits on a broken store.
//!
//! All queries bind parameters at runtime; no user-controlled value is ever
//! interpolated into SQL text.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::StoreSection;
use crate::protocol::CommandStatus;
use crate::registry::{SessionMeta, SessionMode};

use super::{CommandAudit, StoreError};

/// Schema bootstrap, applied idempotently at connect.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_hash        TEXT PRIMARY KEY,
        ip_address          TEXT,
        user_agent          TEXT,
        page_url            TEXT,
        referrer            TEXT,
        screen_width        INT,
        screen_height       INT,
        timezone            TEXT,
        network_type        TEXT,
        battery_level       DOUBLE PRECISION,
        country_code        TEXT,
        city                TEXT,
        latitude            DOUBLE PRECISION,
        longitude           DOUBLE PRECISION,
        isp                 TEXT,
        mode                TEXT NOT NULL DEFAULT 'normal',
        current_latency_ms  INT NOT NULL DEFAULT 0,
        total_events        BIGINT NOT NULL DEFAULT 0,
        risk_score          INT NOT NULL DEFAULT 0,
        is_bot              BOOLEAN NOT NULL DEFAULT FALSE,
        violation_count     INT NOT NULL DEFAULT 0,
        connected           BOOLEAN NOT NULL DEFAULT FALSE,
        first_seen          TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_seen           TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_violation_at   TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS commands (
        command_id      TEXT PRIMARY KEY,
        session_hash    TEXT NOT NULL,
        command_type    TEXT NOT NULL,
        payload         JSONB,
        admin_id        TEXT,
        admin_ip        TEXT,
        status          TEXT NOT NULL DEFAULT 'pending',
        error_message   TEXT,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        acknowledged_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_commands_session ON commands (session_hash, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_last_seen ON sessions (last_seen DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS dashboard_stats (
        id           INT PRIMARY KEY,
        stats        JSONB NOT NULL,
        refreshed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// A durable session row as served to the admin API.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub session_hash: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub page_url: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub mode: String,
    pub current_latency_ms: i32,
    pub total_events: i64,
    pub risk_score: i32,
    pub is_bot: bool,
    pub violation_count: i32,
    pub connected: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A command audit row as served to the admin API.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CommandRow {
    pub command_id: String,
    pub session_hash: String,
    pub command_type: String,
    pub payload: Option<Value>,
    pub admin_id: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Postgres-backed session store. `pool == None` means degraded mode.
pub struct SessionStore {
    pool: Option<PgPool>,
    op_timeout: Duration,
}

impl SessionStore {
    /// A store with no backend; every read is empty, every write a no-op.
    pub fn disabled(section: &StoreSection) -> Self {
        Self {
            pool: None,
            op_timeout: Duration::from_millis(section.op_timeout_ms),
        }
    }

    /// Connect and bootstrap the schema. A missing URL yields a disabled
    /// store; a failing connect is an error for the caller to judge against
    /// `store.required`.
    pub async fn connect(section: &StoreSection) -> Result<Self, StoreError> {
        let Some(url) = section.postgres_url.as_deref() else {
            return Ok(Self::disabled(section));
        };
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_millis(section.connect_timeout_ms))
            .connect(url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        info!(target: "store", "postgres session store connected");
        Ok(Self {
            pool: Some(pool),
            op_timeout: Duration::from_millis(section.op_timeout_ms),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Run one store operation under the deadline, degrading on any fault.
    async fn run<T, F>(&self, what: &'static str, op: F) -> Option<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        self.pool.as_ref()?;
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(Ok(v)) => Some(v),
            Ok(Err(err)) => {
                warn!(target: "store", what, %err, "postgres operation failed");
                None
            }
            Err(_) => {
                warn!(target: "store", what, "postgres operation timed out");
                None
            }
        }
    }

    pub async fn upsert_session(&self, session_hash: &str, meta: &SessionMeta) -> Option<()> {
        let pool = self.pool.clone()?;
        let hash = session_hash.to_string();
        let meta = meta.clone();
        self.run("upsert_session", async move {
            sqlx::query(
                r#"
                INSERT INTO sessions (
                    session_hash, ip_address, user_agent, page_url, referrer,
                    screen_width, screen_height, timezone, network_type,
                    battery_level, country_code, city, latitude, longitude,
                    isp, connected, last_seen
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,TRUE,now())
                ON CONFLICT (session_hash) DO UPDATE SET
                    ip_address = EXCLUDED.ip_address,
                    user_agent = EXCLUDED.user_agent,
                    page_url = EXCLUDED.page_url,
                    referrer = EXCLUDED.referrer,
                    screen_width = EXCLUDED.screen_width,
                    screen_height = EXCLUDED.screen_height,
                    timezone = EXCLUDED.timezone,
                    network_type = EXCLUDED.network_type,
                    battery_level = EXCLUDED.battery_level,
                    country_code = EXCLUDED.country_code,
                    city = EXCLUDED.city,
                    latitude = EXCLUDED.latitude,
                    longitude = EXCLUDED.longitude,
                    isp = EXCLUDED.isp,
                    connected = TRUE,
                    last_seen = now()
                "#,
            )
            .bind(&hash)
            .bind(meta.ip_address.map(|ip| ip.to_string()))
            .bind(&meta.user_agent)
            .bind(&meta.page_url)
            .bind(&meta.referrer)
            .bind(meta.screen_width.map(|v| v.clamp(0, 10_000) as i32))
            .bind(meta.screen_height.map(|v| v.clamp(0, 10_000) as i32))
            .bind(&meta.timezone)
            .bind(&meta.network_type)
            .bind(meta.battery_level.map(|v| v.clamp(0.0, 100.0)))
            .bind(&meta.geo.country_code)
            .bind(&meta.geo.city)
            .bind(meta.geo.latitude.map(|v| v.clamp(-90.0, 90.0)))
            .bind(meta.geo.longitude.map(|v| v.clamp(-180.0, 180.0)))
            .bind(&meta.geo.isp)
            .execute(&pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn set_connected(&self, session_hash: &str, connected: bool) -> Option<()> {
        let pool = self.pool.clone()?;
        let hash = session_hash.to_string();
        self.run("set_connected", async move {
            sqlx::query("UPDATE sessions SET connected = $2, last_seen = now() WHERE session_hash = $1")
                .bind(&hash)
                .bind(connected)
                .execute(&pool)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn increment_event_count(&self, session_hash: &str, delta: u64) -> Option<()> {
        let pool = self.pool.clone()?;
        let hash = session_hash.to_string();
        self.run("increment_event_count", async move {
            sqlx::query(
                "UPDATE sessions SET total_events = total_events + $2, last_seen = now() WHERE session_hash = $1",
            )
            .bind(&hash)
            .bind(delta.min(i64::MAX as u64) as i64)
            .execute(&pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn set_mode(
        &self,
        session_hash: &str,
        mode: SessionMode,
        latency_ms: u32,
    ) -> Option<()> {
        let pool = self.pool.clone()?;
        let hash = session_hash.to_string();
        self.run("set_mode", async move {
            sqlx::query(
                "UPDATE sessions SET mode = $2, current_latency_ms = $3 WHERE session_hash = $1",
            )
            .bind(&hash)
            .bind(mode.as_str())
            .bind(latency_ms.min(60_000) as i32)
            .execute(&pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn set_risk(&self, session_hash: &str, risk_score: u8, is_bot: bool) -> Option<()> {
        let pool = self.pool.clone()?;
        let hash = session_hash.to_string();
        self.run("set_risk", async move {
            sqlx::query("UPDATE sessions SET risk_score = $2, is_bot = $3 WHERE session_hash = $1")
                .bind(&hash)
                .bind(risk_score.min(100) as i32)
                .bind(is_bot)
                .execute(&pool)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn increment_violations(&self, session_hash: &str) -> Option<()> {
        let pool = self.pool.clone()?;
        let hash = session_hash.to_string();
        self.run("increment_violations", async move {
            sqlx::query(
                "UPDATE sessions SET violation_count = violation_count + 1, last_violation_at = now() WHERE session_hash = $1",
            )
            .bind(&hash)
            .execute(&pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn log_command(&self, audit: &CommandAudit) -> Option<()> {
        let pool = self.pool.clone()?;
        let audit = audit.clone();
        self.run("log_command", async move {
            sqlx::query(
                r#"
                INSERT INTO commands (command_id, session_hash, command_type, payload, admin_id, admin_ip, status)
                VALUES ($1,$2,$3,$4,$5,$6,$7)
                ON CONFLICT (command_id) DO NOTHING
                "#,
            )
            .bind(&audit.command_id)
            .bind(&audit.session_hash)
            .bind(audit.command_type.as_str())
            .bind(&audit.payload)
            .bind(&audit.admin_id)
            .bind(&audit.admin_ip)
            .bind(audit.status.as_str())
            .execute(&pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn update_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        error_message: Option<&str>,
    ) -> Option<()> {
        let pool = self.pool.clone()?;
        let id = command_id.to_string();
        let error_message = error_message.map(|s| s.to_string());
        self.run("update_command_status", async move {
            sqlx::query(
                r#"
                UPDATE commands
                SET status = $2,
                    error_message = COALESCE($3, error_message),
                    acknowledged_at = CASE WHEN $2 IN ('acknowledged','failed') THEN now() ELSE acknowledged_at END
                WHERE command_id = $1
                "#,
            )
            .bind(&id)
            .bind(status.as_str())
            .bind(&error_message)
            .execute(&pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Sessions seen within the last `minutes`. Empty on error.
    pub async fn get_active_sessions(&self, minutes: u32) -> Option<Vec<SessionRow>> {
        let pool = self.pool.clone()?;
        self.run("get_active_sessions", async move {
            sqlx::query_as::<_, SessionRow>(
                r#"
                SELECT session_hash, ip_address, user_agent, page_url, country_code,
                       city, isp, mode, current_latency_ms, total_events, risk_score,
                       is_bot, violation_count, connected, first_seen, last_seen
                FROM sessions
                WHERE last_seen > now() - make_interval(mins => $1)
                ORDER BY last_seen DESC
                LIMIT 500
                "#,
            )
            .bind(minutes.min(1_440) as i32)
            .fetch_all(&pool)
            .await
        })
        .await
    }

    pub async fn get_session(&self, session_hash: &str) -> Option<SessionRow> {
        let pool = self.pool.clone()?;
        let hash = session_hash.to_string();
        self.run("get_session", async move {
            sqlx::query_as::<_, SessionRow>(
                r#"
                SELECT session_hash, ip_address, user_agent, page_url, country_code,
                       city, isp, mode, current_latency_ms, total_events, risk_score,
                       is_bot, violation_count, connected, first_seen, last_seen
                FROM sessions
                WHERE session_hash = $1
                "#,
            )
            .bind(&hash)
            .fetch_optional(&pool)
            .await
        })
        .await
        .flatten()
    }

    pub async fn get_high_risk_sessions(&self) -> Option<Vec<SessionRow>> {
        let pool = self.pool.clone()?;
        self.run("get_high_risk_sessions", async move {
            sqlx::query_as::<_, SessionRow>(
                r#"
                SELECT session_hash, ip_address, user_agent, page_url, country_code,
                       city, isp, mode, current_latency_ms, total_events, risk_score,
                       is_bot, violation_count, connected, first_seen, last_seen
                FROM sessions
                WHERE risk_score > 50 OR is_bot
                ORDER BY risk_score DESC, last_seen DESC
                LIMIT 100
                "#,
            )
            .fetch_all(&pool)
            .await
        })
        .await
    }

    pub async fn get_command_history(&self, session_hash: &str, limit: u32) -> Option<Vec<CommandRow>> {
        let pool = self.pool.clone()?;
        let hash = session_hash.to_string();
        self.run("get_command_history", async move {
            sqlx::query_as::<_, CommandRow>(
                r#"
                SELECT command_id, session_hash, command_type, payload, admin_id,
                       status, error_message, created_at, acknowledged_at
                FROM commands
                WHERE session_hash = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(&hash)
            .bind(limit.min(200) as i64)
            .fetch_all(&pool)
            .await
        })
        .await
    }

    pub async fn get_dashboard_stats(&self) -> Option<Value> {
        let pool = self.pool.clone()?;
        self.run("get_dashboard_stats", async move {
            let row = sqlx::query("SELECT stats FROM dashboard_stats WHERE id = 1")
                .fetch_optional(&pool)
                .await?;
            Ok(row.map(|r| r.get::<Value, _>("stats")))
        })
        .await
        .flatten()
    }

    pub async fn upsert_dashboard_stats(&self, stats: &Value) -> Option<()> {
        let pool = self.pool.clone()?;
        let stats = stats.clone();
        self.run("upsert_dashboard_stats", async move {
            sqlx::query(
                r#"
                INSERT INTO dashboard_stats (id, stats, refreshed_at)
                VALUES (1, $1, now())
                ON CONFLICT (id) DO UPDATE SET stats = EXCLUDED.stats, refreshed_at = now()
                "#,
            )
            .bind(&stats)
            .execute(&pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Delete disconnected sessions older than `days`. Returns rows removed.
    pub async fn delete_stale_sessions(&self, days: u32) -> Option<u64> {
        let pool = self.pool.clone()?;
        self.run("delete_stale_sessions", async move {
            sqlx::query(
                "DELETE FROM sessions WHERE NOT connected AND last_seen < now() - make_interval(days => $1)",
            )
            .bind(days as i32)
            .execute(&pool)
            .await
            .map(|r| r.rows_affected())
        })
        .await
    }

    /// Close the pool. Called last during shutdown.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    /// Liveness probe with a short deadline.
    pub async fn healthy(&self) -> bool {
        let Some(pool) = self.pool.clone() else {
            // Unconfigured store: nothing to be unhealthy.
            return true;
        };
        matches!(
            tokio::time::timeout(Duration::from_secs(2), async {
                sqlx::query("SELECT 1").execute(&pool).await
            })
            .await,
            Ok(Ok(_))
        )
    }
}
