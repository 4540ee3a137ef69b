//! Per-session rate limiting
//!
//! Token-bucket admission control keyed by session hash (connection id before
//! binding), with violation tracking, automatic bans, and a lightweight risk
//! score derived from violation pressure. All operations are non-blocking and
//! infallible; callers act on the returned admission verdict.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::LimiterSection;

/// Why an admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Banned,
    RateLimit,
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub retry_after_ms: Option<u64>,
    pub tokens_remaining: Option<u32>,
}

impl Admission {
    fn allowed(tokens_remaining: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_ms: None,
            tokens_remaining: Some(tokens_remaining),
        }
    }

    fn denied(reason: DenyReason, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_ms: Some(retry_after_ms),
            tokens_remaining: None,
        }
    }
}

/// Violation pressure for a key, used for the auto-throttle decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViolationStats {
    pub count: u32,
    pub events_per_second: f64,
    pub should_throttle: bool,
}

/// Aggregate limiter counters for `/admin/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub active_buckets: usize,
    pub tracked_violators: usize,
    pub active_bans: usize,
    pub total_denied: u64,
    pub total_banned: u64,
}

struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

struct Violations {
    count: u32,
    first_at: Instant,
    last_at: Instant,
}

struct Ban {
    banned_at: Instant,
    duration: Duration,
}

impl Ban {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.duration_since(self.banned_at);
        if elapsed < self.duration {
            Some(self.duration - elapsed)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct LimiterInner {
    buckets: HashMap<String, Bucket>,
    violations: HashMap<String, Violations>,
    bans: HashMap<String, Ban>,
}

/// Token-bucket rate limiter with violation tracking and auto-ban.
pub struct RateLimiter {
    config: LimiterSection,
    interval: Duration,
    inner: Mutex<LimiterInner>,
    total_denied: AtomicU64,
    total_banned: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: LimiterSection) -> Self {
        let interval = Duration::from_millis(config.refill_interval_ms.max(1));
        Self {
            config,
            interval,
            inner: Mutex::new(LimiterInner::default()),
            total_denied: AtomicU64::new(0),
            total_banned: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LimiterSection {
        &self.config
    }

    /// Admission check: ban gate, lazy refill, consume or record a violation.
    pub fn admit(&self, key: &str, cost: u32) -> Admission {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        // Ban gate. Expired bans are removed passively on read.
        match inner.bans.get(key).and_then(|b| b.remaining(now)) {
            Some(remaining) => {
                self.total_denied.fetch_add(1, Ordering::Relaxed);
                return Admission::denied(DenyReason::Banned, remaining.as_millis() as u64);
            }
            None => {
                inner.bans.remove(key);
            }
        }

        let capacity = self.config.capacity;
        let refill_rate = self.config.refill_rate;
        let interval = self.interval;
        let bucket = inner.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        });
        bucket.last_seen = now;

        // Lazy refill in whole intervals:
        // tokens = min(capacity, tokens + floor(elapsed/interval) * rate)
        let elapsed = now.duration_since(bucket.last_refill);
        let steps = (elapsed.as_millis() / interval.as_millis().max(1)) as u32;
        if steps > 0 {
            bucket.tokens = bucket
                .tokens
                .saturating_add(steps.saturating_mul(refill_rate))
                .min(capacity);
            bucket.last_refill += interval * steps;
        }

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return Admission::allowed(bucket.tokens);
        }

        // Violation bookkeeping and possible ban transition.
        self.total_denied.fetch_add(1, Ordering::Relaxed);
        let violations = inner
            .violations
            .entry(key.to_string())
            .or_insert(Violations {
                count: 0,
                first_at: now,
                last_at: now,
            });
        violations.count += 1;
        violations.last_at = now;
        let count = violations.count;

        if count >= self.config.ban_threshold && !inner.bans.contains_key(key) {
            inner.bans.insert(
                key.to_string(),
                Ban {
                    banned_at: now,
                    duration: Duration::from_millis(self.config.ban_duration_ms),
                },
            );
            self.total_banned.fetch_add(1, Ordering::Relaxed);
            debug!(target: "limiter", key, count, "session banned");
        }

        let retry_after = cost.div_ceil(refill_rate.max(1)) as u64 * interval.as_millis() as u64;
        Admission::denied(DenyReason::RateLimit, retry_after)
    }

    /// Whether a key is currently banned, and for how much longer.
    pub fn ban_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner.lock().bans.get(key).and_then(|b| b.remaining(now))
    }

    /// Violation pressure for a key. `events_per_second` is violation count
    /// over the observation window since the first violation.
    pub fn violation_stats(&self, key: &str) -> ViolationStats {
        let inner = self.inner.lock();
        match inner.violations.get(key) {
            Some(v) => {
                let window_secs = v.last_at.duration_since(v.first_at).as_secs_f64().max(1.0);
                let eps = v.count as f64 / window_secs;
                ViolationStats {
                    count: v.count,
                    events_per_second: eps,
                    should_throttle: eps > self.config.max_events_per_second,
                }
            }
            None => ViolationStats::default(),
        }
    }

    /// Risk score in [0, 100] from violation pressure; `is_bot` above 80.
    pub fn risk_score(&self, key: &str) -> (u8, bool) {
        let stats = self.violation_stats(key);
        let eps_component: u8 = if stats.events_per_second > 10.0 {
            40
        } else if stats.events_per_second > 5.0 {
            20
        } else {
            0
        };
        let count_component: u8 = if stats.count > 30 {
            30
        } else if stats.count > 10 {
            15
        } else {
            0
        };
        let score = (eps_component + count_component).min(100);
        (score, score > 80)
    }

    /// Lift a ban and clear the violation record for a key.
    pub fn unban(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.bans.remove(key);
        inner.violations.remove(key);
    }

    /// Evict buckets and violation records idle longer than `max_idle`.
    /// Run periodically by background maintenance.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.buckets.len() + inner.violations.len();
        inner
            .buckets
            .retain(|_, b| now.duration_since(b.last_seen) < max_idle);
        inner
            .violations
            .retain(|_, v| now.duration_since(v.last_at) < max_idle);
        let evicted = before - (inner.buckets.len() + inner.violations.len());
        if evicted > 0 {
            debug!(target: "limiter", evicted, "evicted idle limiter entries");
        }
        evicted
    }

    /// Remove expired ban records. Bans also expire passively on read; this
    /// bounds the map for keys that never come back.
    pub fn purge_expired_bans(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.bans.len();
        inner.bans.retain(|_, b| b.remaining(now).is_some());
        before - inner.bans.len()
    }

    pub fn stats(&self) -> LimiterStats {
        let inner = self.inner.lock();
        LimiterStats {
            active_buckets: inner.buckets.len(),
            tracked_violators: inner.violations.len(),
            active_bans: inner.bans.len(),
            total_denied: self.total_denied.load(Ordering::Relaxed),
            total_banned: self.total_banned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_rate: u32, interval_ms: u64) -> RateLimiter {
        RateLimiter::new(LimiterSection {
            capacity,
            refill_rate,
            refill_interval_ms: interval_ms,
            ..LimiterSection::default()
        })
    }

    #[test]
    fn test_initial_burst_consumes_capacity() {
        let rl = limiter(20, 5, 1_000);
        for i in 0..20 {
            let a = rl.admit("k", 1);
            assert!(a.allowed, "admission {i} should pass");
        }
        let denied = rl.admit("k", 1);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::RateLimit));
        assert_eq!(denied.retry_after_ms, Some(1_000));
    }

    #[test]
    fn test_token_conservation_over_interval() {
        // capacity 5, refill 2 per 50ms. Over ~120ms, admitted calls must not
        // exceed initial + ceil(elapsed/interval) * rate.
        let rl = limiter(5, 2, 50);
        let start = Instant::now();
        let mut admitted = 0u32;
        while start.elapsed() < Duration::from_millis(120) {
            if rl.admit("k", 1).allowed {
                admitted += 1;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let intervals = start.elapsed().as_millis().div_ceil(50) as u32;
        assert!(
            admitted <= 5 + intervals * 2,
            "admitted {admitted} exceeds bound for {intervals} intervals"
        );
    }

    #[test]
    fn test_refill_restores_tokens() {
        let rl = limiter(2, 2, 30);
        assert!(rl.admit("k", 1).allowed);
        assert!(rl.admit("k", 1).allowed);
        assert!(!rl.admit("k", 1).allowed);
        std::thread::sleep(Duration::from_millis(40));
        assert!(rl.admit("k", 1).allowed);
    }

    #[test]
    fn test_ban_after_threshold_and_monotonicity() {
        let rl = RateLimiter::new(LimiterSection {
            capacity: 1,
            refill_rate: 1,
            refill_interval_ms: 60_000,
            ban_threshold: 3,
            ban_duration_ms: 50,
            ..LimiterSection::default()
        });
        assert!(rl.admit("k", 1).allowed);
        // Three denials reach the threshold.
        for _ in 0..3 {
            let a = rl.admit("k", 1);
            assert!(!a.allowed);
        }
        let banned = rl.admit("k", 1);
        assert_eq!(banned.reason, Some(DenyReason::Banned));
        assert!(banned.retry_after_ms.unwrap() <= 50);
        assert!(rl.ban_remaining("k").is_some());

        // Ban holds for its full duration regardless of traffic, then lifts.
        std::thread::sleep(Duration::from_millis(60));
        assert!(rl.ban_remaining("k").is_none());
        let after = rl.admit("k", 1);
        assert_ne!(after.reason, Some(DenyReason::Banned));
    }

    #[test]
    fn test_violation_stats_and_throttle_signal() {
        let rl = RateLimiter::new(LimiterSection {
            capacity: 1,
            refill_rate: 1,
            refill_interval_ms: 60_000,
            max_events_per_second: 5.0,
            ban_threshold: 1_000,
            ..LimiterSection::default()
        });
        assert!(rl.admit("k", 1).allowed);
        for _ in 0..10 {
            rl.admit("k", 1);
        }
        let stats = rl.violation_stats("k");
        assert_eq!(stats.count, 10);
        // 10 violations inside a sub-second window => eps = count / 1s floor.
        assert!(stats.events_per_second > 5.0);
        assert!(stats.should_throttle);
        assert_eq!(rl.violation_stats("other").count, 0);
    }

    #[test]
    fn test_risk_score_clamped_and_tiered() {
        let rl = RateLimiter::new(LimiterSection {
            capacity: 1,
            refill_rate: 1,
            refill_interval_ms: 60_000,
            ban_threshold: 1_000,
            ..LimiterSection::default()
        });
        let (score, is_bot) = rl.risk_score("quiet");
        assert_eq!(score, 0);
        assert!(!is_bot);

        rl.admit("k", 1);
        for _ in 0..35 {
            rl.admit("k", 1);
        }
        let (score, is_bot) = rl.risk_score("k");
        // eps > 10 (40) + count > 30 (30)
        assert_eq!(score, 70);
        assert!(!is_bot);
        assert!(score <= 100);
    }

    #[test]
    fn test_per_key_isolation() {
        let rl = limiter(2, 1, 60_000);
        assert!(rl.admit("a", 1).allowed);
        assert!(rl.admit("a", 1).allowed);
        assert!(!rl.admit("a", 1).allowed);
        assert!(rl.admit("b", 1).allowed);
    }

    #[test]
    fn test_eviction_and_ban_purge() {
        let rl = RateLimiter::new(LimiterSection {
            capacity: 1,
            refill_rate: 1,
            refill_interval_ms: 60_000,
            ban_threshold: 2,
            ban_duration_ms: 10,
            ..LimiterSection::default()
        });
        rl.admit("k", 1);
        rl.admit("k", 1);
        rl.admit("k", 1);
        assert_eq!(rl.stats().active_buckets, 1);
        assert_eq!(rl.stats().active_bans, 1);

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(rl.purge_expired_bans(), 1);
        assert!(rl.evict_idle(Duration::from_millis(1)) >= 1);
        let stats = rl.stats();
        assert_eq!(stats.active_buckets, 0);
        assert_eq!(stats.active_bans, 0);
    }

    #[test]
    fn test_unban_clears_violations() {
        let rl = RateLimiter::new(LimiterSection {
            capacity: 1,
            refill_rate: 1,
            refill_interval_ms: 60_000,
            ban_threshold: 2,
            ..LimiterSection::default()
        });
        rl.admit("k", 1);
        rl.admit("k", 1);
        rl.admit("k", 1);
        assert!(rl.ban_remaining("k").is_some());
        rl.unban("k");
        assert!(rl.ban_remaining("k").is_none());
        assert_eq!(rl.violation_stats("k").count, 0);
    }
}
