//! Configuration loading
//!
//! Typed configuration loaded from an optional JSON file with environment
//! variable overrides. Resolution order per field: `SPINDLE_*` env var, then
//! the config file, then the built-in default.
//!
//! File path resolution: `SPINDLE_CONFIG` env var, falling back to
//! `./spindle.json` in the working directory. A missing file is not an
//! error; the defaults are production-ready except for `admin.api_key`,
//! which must be set explicitly.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("missing required field: {field}")]
    Missing { field: String },
}

/// Listener section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
        }
    }
}

/// Admin API section. The shared secret is compared in constant time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdminSection {
    pub api_key: String,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            api_key: String::new(),
        }
    }
}

/// Per-session rate limiter parameters (see the limiter module).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LimiterSection {
    /// Maximum tokens in a bucket.
    pub capacity: u32,
    /// Tokens added per refill interval.
    pub refill_rate: u32,
    /// Refill interval in milliseconds.
    pub refill_interval_ms: u64,
    /// Soft threshold for the auto-throttle signal (violations/sec).
    pub max_events_per_second: f64,
    /// Whether violating sessions are automatically throttled.
    pub auto_throttle: bool,
    /// Latency applied when auto-throttling, in milliseconds.
    pub throttle_latency_ms: u32,
    /// Violation count at which a session is banned.
    pub ban_threshold: u32,
    /// Ban duration in milliseconds.
    pub ban_duration_ms: u64,
    /// Idle age after which buckets and violation records are evicted.
    pub inactivity_eviction_ms: u64,
}

impl Default for LimiterSection {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_rate: 5,
            refill_interval_ms: 1_000,
            max_events_per_second: 5.0,
            auto_throttle: true,
            throttle_latency_ms: 2_000,
            ban_threshold: 50,
            ban_duration_ms: 300_000,
            inactivity_eviction_ms: 3_600_000,
        }
    }
}

/// External store endpoints. All optional; an unconfigured store runs the
/// server in degraded (in-memory only) mode for that concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreSection {
    /// Postgres connection URL (session metadata, command audit).
    pub postgres_url: Option<String>,
    /// ClickHouse HTTP endpoint (events, command log, violations).
    pub clickhouse_url: Option<String>,
    /// ClickHouse database name. Identifier characters only.
    pub clickhouse_database: String,
    /// Redis URL for the command bus. Unset = in-process bus.
    pub redis_url: Option<String>,
    /// When true, a store that fails to initialize aborts startup.
    pub required: bool,
    /// Store connect deadline in milliseconds.
    pub connect_timeout_ms: u64,
    /// Store operation deadline in milliseconds.
    pub op_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            postgres_url: None,
            clickhouse_url: None,
            clickhouse_database: "spindle".to_string(),
            redis_url: None,
            required: false,
            connect_timeout_ms: 2_000,
            op_timeout_ms: 30_000,
        }
    }
}

/// GeoIP section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeoSection {
    /// CSV range database path. Unset = every lookup misses.
    pub database_path: Option<PathBuf>,
}

/// HTTP ingress rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IngressSection {
    pub requests_per_minute: u32,
    pub exempt_loopback: bool,
    pub enabled: bool,
}

impl Default for IngressSection {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            exempt_loopback: true,
            enabled: true,
        }
    }
}

/// WebSocket connection handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WsSection {
    /// Keepalive ping interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Close connections with no traffic for this long.
    pub idle_timeout_ms: u64,
    /// Maximum inbound frame size in bytes.
    pub max_frame_bytes: usize,
}

impl Default for WsSection {
    fn default() -> Self {
        Self {
            ping_interval_ms: 30_000,
            idle_timeout_ms: 90_000,
            max_frame_bytes: 256 * 1024,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub server: ServerSection,
    pub admin: AdminSection,
    pub limiter: LimiterSection,
    pub store: StoreSection,
    pub geoip: GeoSection,
    pub ingress: IngressSection,
    pub ws: WsSection,
}

/// Get the config file path (`SPINDLE_CONFIG` > `./spindle.json`).
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("SPINDLE_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("spindle.json")
}

/// Load configuration from the resolved path, apply env overrides, validate.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = get_config_path();
    let mut config = load_config_file(&path)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Load just the file layer. A missing file yields the defaults.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Apply `SPINDLE_*` environment overrides on top of the file layer.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = env::var("SPINDLE_HOST") {
        config.server.host = v;
    }
    if let Ok(v) = env::var("SPINDLE_PORT") {
        if let Ok(port) = v.parse() {
            config.server.port = port;
        }
    }
    if let Ok(v) = env::var("SPINDLE_API_KEY") {
        config.admin.api_key = v;
    }
    if let Ok(v) = env::var("SPINDLE_POSTGRES_URL") {
        config.store.postgres_url = non_empty(v);
    }
    if let Ok(v) = env::var("SPINDLE_CLICKHOUSE_URL") {
        config.store.clickhouse_url = non_empty(v);
    }
    if let Ok(v) = env::var("SPINDLE_CLICKHOUSE_DATABASE") {
        config.store.clickhouse_database = v;
    }
    if let Ok(v) = env::var("SPINDLE_REDIS_URL") {
        config.store.redis_url = non_empty(v);
    }
    if let Ok(v) = env::var("SPINDLE_GEOIP_PATH") {
        config.geoip.database_path = non_empty(v).map(PathBuf::from);
    }
}

fn non_empty(v: String) -> Option<String> {
    if v.trim().is_empty() {
        None
    } else {
        Some(v)
    }
}

impl Config {
    /// Validate the assembled configuration. Errors here are startup-fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin.api_key.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "admin.apiKey (or SPINDLE_API_KEY)".to_string(),
            });
        }
        if self.limiter.capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "limiter.capacity".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        if self.limiter.refill_rate == 0 || self.limiter.refill_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "limiter.refillRate / limiter.refillIntervalMs".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        if !is_identifier(&self.store.clickhouse_database) {
            return Err(ConfigError::Invalid {
                field: "store.clickhouseDatabase".to_string(),
                message: "identifier characters only ([A-Za-z0-9_])".to_string(),
            });
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> Config {
        let mut config = Config::default();
        config.admin.api_key = "test-key".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.limiter.capacity, 20);
        assert_eq!(config.limiter.refill_rate, 5);
        assert_eq!(config.limiter.ban_threshold, 50);
        assert_eq!(config.limiter.ban_duration_ms, 300_000);
        assert_eq!(config.ingress.requests_per_minute, 100);
        assert_eq!(config.ws.ping_interval_ms, 30_000);
        assert_eq!(config.ws.idle_timeout_ms, 90_000);
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing { .. })
        ));
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_database_name() {
        let mut config = base_config();
        config.store.clickhouse_database = "bad-name; DROP".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let config = load_config_file(Path::new("/nonexistent/spindle.json")).unwrap();
        assert_eq!(config.server.port, 8787);
    }

    #[test]
    fn test_load_file_layer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server":{{"port":9999}},"admin":{{"apiKey":"s3cret"}},"limiter":{{"capacity":7}}}}"#
        )
        .unwrap();
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.admin.api_key, "s3cret");
        assert_eq!(config.limiter.capacity, 7);
        // Untouched sections keep defaults
        assert_eq!(config.limiter.refill_rate, 5);
        assert_eq!(config.ingress.requests_per_minute, 100);
    }

    #[test]
    fn test_parse_error_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            load_config_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
