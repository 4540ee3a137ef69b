//! HTTP ingress rate limiting middleware
//!
//! Token-bucket limiting per client IP across all HTTP routes. Distinct from
//! the per-session limiter that gates WebSocket traffic: this one protects
//! the HTTP surface itself (admin API, beacon, health).

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::IngressSection;

/// Cleanup cadence for stale client entries.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Entries idle this long are removed.
const ENTRY_EXPIRY: Duration = Duration::from_secs(600);

/// Token bucket state for a single client IP.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    max_tokens: f64,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, burst: f64) -> Self {
        TokenBucket {
            tokens: burst,
            last_refill: Instant::now(),
            rate: rate_per_sec,
            max_tokens: burst,
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
    }
}

#[derive(Debug)]
struct ClientEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-IP ingress limiter shared across all HTTP routes.
#[derive(Clone)]
pub struct IngressLimiter {
    buckets: Arc<RwLock<HashMap<IpAddr, ClientEntry>>>,
    config: Arc<IngressSection>,
    last_cleanup: Arc<RwLock<Instant>>,
}

impl IngressLimiter {
    pub fn new(config: IngressSection) -> Self {
        IngressLimiter {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            last_cleanup: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Check whether a request from `client_ip` is allowed. On denial,
    /// returns how long until a token frees up.
    pub fn check(&self, client_ip: IpAddr) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.config.exempt_loopback && client_ip.is_loopback() {
            return Ok(());
        }

        self.maybe_cleanup();

        let rate = self.config.requests_per_minute as f64 / 60.0;
        let burst = self.config.requests_per_minute as f64;

        let mut buckets = self.buckets.write();
        let entry = buckets.entry(client_ip).or_insert_with(|| ClientEntry {
            bucket: TokenBucket::new(rate, burst),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();

        if entry.bucket.try_consume() {
            Ok(())
        } else {
            Err(entry.bucket.time_until_available())
        }
    }

    fn maybe_cleanup(&self) {
        {
            let mut last_cleanup = self.last_cleanup.write();
            if last_cleanup.elapsed() < CLEANUP_INTERVAL {
                return;
            }
            *last_cleanup = Instant::now();
        }

        let mut buckets = self.buckets.write();
        buckets.retain(|_, entry| entry.last_seen.elapsed() < ENTRY_EXPIRY);
        debug!(target: "admin", remaining = buckets.len(), "ingress limiter cleanup");
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.read().len()
    }
}

/// Axum middleware enforcing the ingress limit.
pub async fn ingress_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<IngressLimiter>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(ConnectInfo(addr)) = connect_info else {
        // No peer address (e.g. in-process test client): let it through.
        warn!(target: "admin", "ingress limit: no client address");
        return next.run(request).await;
    };

    match limiter.check(addr.ip()) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(target: "admin", ip = %addr.ip(), path = %request.uri().path(), "ingress rate limit exceeded");
            let secs = retry_after.as_secs().max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (header::RETRY_AFTER, secs.to_string()),
                ],
                format!(r#"{{"error":"Too many requests","retryAfter":{secs}}}"#),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn section(rpm: u32, exempt_loopback: bool) -> IngressSection {
        IngressSection {
            requests_per_minute: rpm,
            exempt_loopback,
            enabled: true,
        }
    }

    #[test]
    fn test_burst_up_to_limit_then_denied() {
        let limiter = IngressLimiter::new(section(5, false));
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        for _ in 0..5 {
            assert!(limiter.check(ip).is_ok());
        }
        let retry = limiter.check(ip).unwrap_err();
        assert!(retry > Duration::ZERO);
    }

    #[test]
    fn test_per_ip_isolation() {
        let limiter = IngressLimiter::new(section(2, false));
        let ip1 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let ip2 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));
        assert!(limiter.check(ip1).is_ok());
        assert!(limiter.check(ip1).is_ok());
        assert!(limiter.check(ip1).is_err());
        assert!(limiter.check(ip2).is_ok());
    }

    #[test]
    fn test_loopback_exemption() {
        let limiter = IngressLimiter::new(section(1, true));
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..50 {
            assert!(limiter.check(loopback).is_ok());
        }
    }

    #[test]
    fn test_disabled_allows_everything() {
        let limiter = IngressLimiter::new(IngressSection {
            requests_per_minute: 1,
            exempt_loopback: false,
            enabled: false,
        });
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        for _ in 0..100 {
            assert!(limiter.check(ip).is_ok());
        }
    }

    #[test]
    fn test_refill_restores_tokens() {
        let mut bucket = TokenBucket::new(100.0, 2.0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        std::thread::sleep(Duration::from_millis(30));
        bucket.refill();
        assert!(bucket.tokens > 0.0);
    }
}
