//! ClickHouse event log adapter
//!
//! Append-only time-series store for telemetry events, the command log, and
//! rate-limit violations, spoken over the ClickHouse HTTP interface. Values
//! are bound server-side with `{pN:Type}` placeholders; the only identifier
//! interpolated into query text is the database name, which the config layer
//! restricts to `[A-Za-z0-9_]`.
//!
//! Rows carry a 30-day TTL. Inserts use `JSONEachRow`, one line per event.

use chrono::DateTime;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::StoreSection;
use crate::sink::NormalizedEvent;

use super::{CommandAudit, StoreError};

fn schema(db: &str) -> Vec<String> {
    vec![
        format!("CREATE DATABASE IF NOT EXISTS {db}"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {db}.events (
                ts               DateTime64(3),
                session_hash     String,
                event_type       LowCardinality(String),
                interaction_type String,
                ip               UInt32,
                page_url         String,
                element          String,
                latency_ms       UInt32,
                screen_width     UInt16,
                screen_height    UInt16,
                country_code     String,
                city             String,
                isp              String,
                latitude         Float64,
                longitude        Float64,
                battery          Nullable(Float64),
                risk_score       UInt8,
                payload          String
            )
            ENGINE = MergeTree
            ORDER BY (session_hash, ts)
            TTL toDate(ts) + INTERVAL 30 DAY
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {db}.command_log (
                ts           DateTime64(3),
                command_id   String,
                session_hash String,
                command_type LowCardinality(String),
                admin_id     String,
                status       LowCardinality(String)
            )
            ENGINE = MergeTree
            ORDER BY (session_hash, ts)
            TTL toDate(ts) + INTERVAL 30 DAY
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {db}.violations (
                ts              DateTime64(3),
                session_hash    String,
                ip_address      String,
                violation_count UInt32
            )
            ENGINE = MergeTree
            ORDER BY (session_hash, ts)
            TTL toDate(ts) + INTERVAL 30 DAY
            "#
        ),
    ]
}

/// Format Unix milliseconds the way ClickHouse expects DateTime64 input.
fn format_ts(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

/// ClickHouse-backed event log. `base_url == None` means degraded mode.
pub struct EventLogStore {
    http: reqwest::Client,
    base_url: Option<String>,
    database: String,
}

impl EventLogStore {
    pub fn disabled(section: &StoreSection) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: None,
            database: section.clickhouse_database.clone(),
        }
    }

    /// Connect and bootstrap the schema. A missing URL yields a disabled
    /// store; bootstrap failure is an error for the caller to judge against
    /// `store.required`.
    pub async fn connect(section: &StoreSection) -> Result<Self, StoreError> {
        let Some(url) = section.clickhouse_url.as_deref() else {
            return Ok(Self::disabled(section));
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(section.connect_timeout_ms))
            .timeout(Duration::from_millis(section.op_timeout_ms))
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let store = Self {
            http,
            base_url: Some(url.trim_end_matches('/').to_string()),
            database: section.clickhouse_database.clone(),
        };
        for stmt in schema(&store.database) {
            store.exec(&stmt, &[]).await?;
        }
        info!(target: "store", "clickhouse event log connected");
        Ok(store)
    }

    pub fn is_enabled(&self) -> bool {
        self.base_url.is_some()
    }

    /// Run a statement with bound `{pN:Type}` parameters.
    async fn exec(&self, query: &str, params: &[(&str, String)]) -> Result<(), StoreError> {
        let base = self.base_url.as_deref().ok_or(StoreError::Unavailable)?;
        let mut pairs: Vec<(String, String)> = vec![("query".to_string(), query.to_string())];
        for (name, value) in params {
            pairs.push((format!("param_{name}"), value.clone()));
        }
        let resp = self
            .http
            .post(base)
            .query(&pairs)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let detail = resp.text().await.unwrap_or_default();
            Err(StoreError::Backend(detail))
        }
    }

    /// Run a `FORMAT JSON` query and return its `data` rows.
    async fn query_rows(&self, query: &str, params: &[(&str, String)]) -> Option<Vec<Value>> {
        let base = self.base_url.as_deref()?;
        let mut pairs: Vec<(String, String)> = vec![("query".to_string(), query.to_string())];
        for (name, value) in params {
            pairs.push((format!("param_{name}"), value.clone()));
        }
        let result = async {
            let resp = self.http.post(base).query(&pairs).send().await?;
            resp.error_for_status()?.json::<Value>().await
        }
        .await;
        match result {
            Ok(body) => body.get("data").and_then(|d| d.as_array()).cloned(),
            Err(err) => {
                warn!(target: "store", %err, "clickhouse query failed");
                None
            }
        }
    }

    /// Insert a batch of normalized events. Errors propagate so the sink can
    /// re-queue the batch.
    pub async fn insert_events(&self, batch: &[NormalizedEvent]) -> Result<(), StoreError> {
        if self.base_url.is_none() {
            return Err(StoreError::Unavailable);
        }
        if batch.is_empty() {
            return Ok(());
        }
        let base = self.base_url.as_deref().unwrap();
        let query = format!("INSERT INTO {}.events FORMAT JSONEachRow", self.database);
        let mut body = String::with_capacity(batch.len() * 256);
        for event in batch {
            body.push_str(&event_row(event).to_string());
            body.push('\n');
        }
        let resp = self
            .http
            .post(base)
            .query(&[("query", query.as_str())])
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let detail = resp.text().await.unwrap_or_default();
            Err(StoreError::Backend(detail))
        }
    }

    /// Best-effort append to the command log.
    pub async fn append_command_log(&self, audit: &CommandAudit) -> Option<()> {
        if self.base_url.is_none() {
            return None;
        }
        let query = format!("INSERT INTO {}.command_log FORMAT JSONEachRow", self.database);
        let row = json!({
            "ts": format_ts(audit.created_at_ms),
            "command_id": audit.command_id,
            "session_hash": audit.session_hash,
            "command_type": audit.command_type.as_str(),
            "admin_id": audit.admin_id,
            "status": audit.status.as_str(),
        });
        self.append_row(&query, row).await
    }

    /// Best-effort append of a rate-limit violation.
    pub async fn append_violation(
        &self,
        session_hash: &str,
        ip_address: Option<&str>,
        violation_count: u32,
    ) -> Option<()> {
        if self.base_url.is_none() {
            return None;
        }
        let query = format!("INSERT INTO {}.violations FORMAT JSONEachRow", self.database);
        let row = json!({
            "ts": format_ts(crate::protocol::now_ms()),
            "session_hash": session_hash,
            "ip_address": ip_address.unwrap_or(""),
            "violation_count": violation_count,
        });
        self.append_row(&query, row).await
    }

    async fn append_row(&self, query: &str, row: Value) -> Option<()> {
        let base = self.base_url.as_deref()?;
        let result = self
            .http
            .post(base)
            .query(&[("query", query)])
            .body(format!("{row}\n"))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => Some(()),
            Err(err) => {
                warn!(target: "store", %err, "clickhouse append failed");
                None
            }
        }
    }

    /// Recent events for one session, newest first. Empty on error.
    pub async fn recent_events(&self, session_hash: &str, limit: u32) -> Vec<Value> {
        let query = format!(
            "SELECT * FROM {}.events WHERE session_hash = {{p0:String}} \
             ORDER BY ts DESC LIMIT {{p1:UInt32}} FORMAT JSON",
            self.database
        );
        self.query_rows(
            &query,
            &[
                ("p0", session_hash.to_string()),
                ("p1", limit.min(500).to_string()),
            ],
        )
        .await
        .unwrap_or_default()
    }

    /// Aggregate traffic summary over the trailing window.
    pub async fn summary(&self, hours: u32) -> Value {
        let hours = hours.clamp(1, 720).to_string();
        let totals_query = format!(
            "SELECT count() AS totalEvents, uniqExact(session_hash) AS uniqueSessions \
             FROM {}.events WHERE ts > now() - INTERVAL {{p0:UInt32}} HOUR FORMAT JSON",
            self.database
        );
        let by_type_query = format!(
            "SELECT event_type AS eventType, count() AS events \
             FROM {}.events WHERE ts > now() - INTERVAL {{p0:UInt32}} HOUR \
             GROUP BY event_type ORDER BY events DESC FORMAT JSON",
            self.database
        );
        let totals = self
            .query_rows(&totals_query, &[("p0", hours.clone())])
            .await
            .and_then(|rows| rows.into_iter().next())
            .unwrap_or_else(|| json!({}));
        let by_type = self
            .query_rows(&by_type_query, &[("p0", hours)])
            .await
            .unwrap_or_default();
        json!({ "totals": totals, "byType": by_type })
    }

    /// Events and sessions per country over the trailing window.
    pub async fn geo_distribution(&self, hours: u32) -> Vec<Value> {
        let query = format!(
            "SELECT country_code AS countryCode, count() AS events, \
             uniqExact(session_hash) AS sessions \
             FROM {}.events \
             WHERE ts > now() - INTERVAL {{p0:UInt32}} HOUR AND country_code != '' \
             GROUP BY country_code ORDER BY events DESC LIMIT 50 FORMAT JSON",
            self.database
        );
        self.query_rows(&query, &[("p0", hours.clamp(1, 720).to_string())])
            .await
            .unwrap_or_default()
    }

    /// Active row counts per table, for the analytics surface.
    pub async fn db_stats(&self) -> Value {
        let query = "SELECT table, sum(rows) AS rows FROM system.parts \
                     WHERE database = {p0:String} AND active GROUP BY table FORMAT JSON";
        let rows = self
            .query_rows(query, &[("p0", self.database.clone())])
            .await
            .unwrap_or_default();
        json!({ "tables": rows })
    }

    /// Liveness probe against `/ping` with a short deadline.
    pub async fn healthy(&self) -> bool {
        let Some(base) = self.base_url.as_deref() else {
            // Unconfigured store: nothing to be unhealthy.
            return true;
        };
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            self.http.get(format!("{base}/ping")).send(),
        )
        .await;
        matches!(result, Ok(Ok(resp)) if resp.status().is_success())
    }
}

fn event_row(event: &NormalizedEvent) -> Value {
    json!({
        "ts": format_ts(event.timestamp_ms),
        "session_hash": event.session_hash,
        "event_type": event.event_type,
        "interaction_type": event.interaction_type.as_deref().unwrap_or(""),
        "ip": event.ip,
        "page_url": event.page_url.as_deref().unwrap_or(""),
        "element": event.element.as_deref().unwrap_or(""),
        "latency_ms": event.latency_ms.unwrap_or(0),
        "screen_width": event.screen_width.unwrap_or(0),
        "screen_height": event.screen_height.unwrap_or(0),
        "country_code": event.country_code.as_deref().unwrap_or(""),
        "city": event.city.as_deref().unwrap_or(""),
        "isp": event.isp.as_deref().unwrap_or(""),
        "latitude": event.latitude.unwrap_or(0.0),
        "longitude": event.longitude.unwrap_or(0.0),
        "battery": event.battery_level,
        "risk_score": event.risk_score.unwrap_or(0),
        "payload": event.payload,
    })
}
