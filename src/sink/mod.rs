//! Event sink
//!
//! Bounded, batching write path into the event log. Events are normalized at
//! enqueue time (clamped numerics, validated IPv4, truncated payload) and
//! flushed in batches on a fixed interval. The queue prefers dropping to
//! growing: overflow drops the new event and counts it.
//!
//! On flush failure up to [`REQUEUE_LIMIT`] events return to the head of the
//! queue; the rest are dropped and logged. During shutdown new events are
//! refused and the residual queue is drained with one final flush.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::geoip::GeoInfo;
use crate::protocol::now_ms;
use crate::store::EventLogStore;

/// Hard bound on queued events.
pub const MAX_QUEUE: usize = 10_000;
/// Events per insert batch.
pub const BATCH_SIZE: usize = 100;
/// Flush cadence.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(5_000);
/// Maximum events returned to the queue after a failed flush.
pub const REQUEUE_LIMIT: usize = 1_000;
/// Payload JSON is truncated to this many bytes.
pub const MAX_PAYLOAD_BYTES: usize = 10_000;

const MAX_SHORT_STRING: usize = 64;
const MAX_URL: usize = 2_048;
const MAX_ELEMENT: usize = 256;

/// A fully normalized event row, ready for the event log.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedEvent {
    pub session_hash: String,
    pub event_type: String,
    pub interaction_type: Option<String>,
    /// IPv4 as a 32-bit integer; 0 when absent or not IPv4.
    pub ip: u32,
    pub timestamp_ms: i64,
    pub page_url: Option<String>,
    pub element: Option<String>,
    pub latency_ms: Option<u32>,
    pub screen_width: Option<u16>,
    pub screen_height: Option<u16>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub battery_level: Option<f64>,
    pub risk_score: Option<u8>,
    /// Raw event JSON, truncated to [`MAX_PAYLOAD_BYTES`].
    pub payload: String,
}

/// Sink counters for stats surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkStats {
    pub queued: usize,
    pub enqueued_total: u64,
    pub flushed_total: u64,
    pub dropped_total: u64,
}

/// Bounded batching queue in front of the event log.
pub struct EventSink {
    queue: Mutex<VecDeque<NormalizedEvent>>,
    shutting_down: AtomicBool,
    enqueued: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
}

impl EventSink {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            shutting_down: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an event. Returns false when refused (overflow or shutdown);
    /// refusals are counted, never propagated.
    pub fn enqueue(&self, event: NormalizedEvent) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut queue = self.queue.lock();
        if queue.len() >= MAX_QUEUE {
            drop(queue);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(event);
        drop(queue);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Stop accepting events ahead of the final flush.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            queued: self.queue.lock().len(),
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            flushed_total: self.flushed.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn drain_batch(&self) -> Vec<NormalizedEvent> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(BATCH_SIZE);
        queue.drain(..n).collect()
    }

    /// Return a failed batch to the head of the queue, capped by
    /// [`REQUEUE_LIMIT`] and the queue bound. Returns how many were dropped.
    fn requeue_front(&self, batch: Vec<NormalizedEvent>) -> usize {
        let mut queue = self.queue.lock();
        let room = MAX_QUEUE.saturating_sub(queue.len());
        let keep = batch.len().min(REQUEUE_LIMIT).min(room);
        let dropped = batch.len() - keep;
        for event in batch.into_iter().take(keep).rev() {
            queue.push_front(event);
        }
        drop(queue);
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Flush everything currently queued, batch by batch. Stops early on the
/// first failed insert after re-queueing that batch.
async fn flush_pending(sink: &EventSink, store: &EventLogStore) {
    if !store.is_enabled() {
        let discarded = sink.clear();
        if discarded > 0 {
            sink.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
            debug!(target: "sink", discarded, "event log disabled, discarding queued events");
        }
        return;
    }
    loop {
        let batch = sink.drain_batch();
        if batch.is_empty() {
            return;
        }
        let n = batch.len();
        match store.insert_events(&batch).await {
            Ok(()) => {
                sink.flushed.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(err) => {
                let dropped = sink.requeue_front(batch);
                warn!(target: "sink", %err, requeued = n - dropped, dropped, "event flush failed");
                return;
            }
        }
    }
}

/// Periodic flush task. Owns the flush cadence and the shutdown drain.
pub async fn run_flusher(
    sink: Arc<EventSink>,
    store: Arc<EventLogStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => flush_pending(&sink, &store).await,
            _ = shutdown.changed() => break,
        }
    }
    sink.begin_shutdown();
    flush_pending(&sink, &store).await;
    debug!(target: "sink", "event sink drained");
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn bounded(value: Option<&str>, max: usize) -> Option<String> {
    value.map(|s| truncate_str(s, max).to_string())
}

fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn str_field<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| raw.get(k).and_then(|v| v.as_str()))
}

fn num_field(raw: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| raw.get(k).and_then(|v| v.as_f64()))
}

/// IPv4 to its 32-bit integer form; anything else is 0.
pub fn ipv4_to_u32(ip: Option<IpAddr>) -> u32 {
    match ip {
        Some(IpAddr::V4(v4)) => u32::from(v4),
        _ => 0,
    }
}

/// Normalize one raw client event into an event-log row. The session hash,
/// peer address, and server timestamp are stamped here; every numeric field
/// is clamped to its documented range.
pub fn normalize_event(
    raw: &Value,
    session_hash: &str,
    peer_ip: Option<IpAddr>,
    geo: &GeoInfo,
    risk_score: Option<u8>,
) -> NormalizedEvent {
    let timestamp_ms = raw
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .filter(|ts| *ts > 0)
        .unwrap_or_else(now_ms);

    let payload = {
        let serialized = raw.to_string();
        truncate_str(&serialized, MAX_PAYLOAD_BYTES).to_string()
    };

    NormalizedEvent {
        session_hash: session_hash.to_string(),
        event_type: bounded(
            str_field(raw, &["type", "eventType"]).or(Some("event")),
            MAX_SHORT_STRING,
        )
        .unwrap(),
        interaction_type: bounded(str_field(raw, &["interactionType"]), MAX_SHORT_STRING),
        ip: ipv4_to_u32(peer_ip),
        timestamp_ms,
        page_url: bounded(str_field(raw, &["pageUrl", "url"]), MAX_URL),
        element: bounded(str_field(raw, &["element", "target"]), MAX_ELEMENT),
        latency_ms: num_field(raw, &["latencyMs", "latency"])
            .map(|v| v.clamp(0.0, 60_000.0) as u32),
        screen_width: num_field(raw, &["screenWidth"]).map(|v| v.clamp(0.0, 10_000.0) as u16),
        screen_height: num_field(raw, &["screenHeight"]).map(|v| v.clamp(0.0, 10_000.0) as u16),
        latitude: geo.latitude.map(|v| v.clamp(-90.0, 90.0)),
        longitude: geo.longitude.map(|v| v.clamp(-180.0, 180.0)),
        country_code: geo.country_code.clone(),
        city: geo.city.clone(),
        isp: geo.isp.clone(),
        battery_level: num_field(raw, &["batteryLevel", "battery"]).map(|v| v.clamp(0.0, 100.0)),
        risk_score: risk_score.map(|v| v.min(100)),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "abcdef0123456789abcdef0123456789";

    fn event(i: usize) -> NormalizedEvent {
        normalize_event(&json!({ "type": "event", "seq": i }), HASH, None, &GeoInfo::default(), None)
    }

    #[test]
    fn test_queue_bound_drops_on_overflow() {
        let sink = EventSink::new();
        for i in 0..MAX_QUEUE {
            assert!(sink.enqueue(event(i)));
        }
        assert!(!sink.enqueue(event(MAX_QUEUE)));
        let stats = sink.stats();
        assert_eq!(stats.queued, MAX_QUEUE);
        assert_eq!(stats.dropped_total, 1);
    }

    #[test]
    fn test_shutdown_refuses_new_events() {
        let sink = EventSink::new();
        assert!(sink.enqueue(event(0)));
        sink.begin_shutdown();
        assert!(!sink.enqueue(event(1)));
        assert_eq!(sink.stats().queued, 1);
    }

    #[test]
    fn test_drain_batch_is_fifo_and_bounded() {
        let sink = EventSink::new();
        for i in 0..(BATCH_SIZE + 5) {
            sink.enqueue(event(i));
        }
        let batch = sink.drain_batch();
        assert_eq!(batch.len(), BATCH_SIZE);
        assert_eq!(batch[0].payload, event(0).payload);
        assert_eq!(sink.stats().queued, 5);
    }

    #[test]
    fn test_requeue_preserves_order_at_head() {
        let sink = EventSink::new();
        for i in 0..10 {
            sink.enqueue(event(i));
        }
        let batch = sink.drain_batch();
        assert_eq!(sink.requeue_front(batch), 0);
        let again = sink.drain_batch();
        assert_eq!(again[0].payload, event(0).payload);
        assert_eq!(again[9].payload, event(9).payload);
    }

    #[test]
    fn test_normalize_clamps_ranges() {
        let raw = json!({
            "type": "interaction",
            "interactionType": "click",
            "screenWidth": 50_000,
            "screenHeight": -5,
            "latencyMs": 99_999,
            "batteryLevel": 150,
        });
        let geo = GeoInfo {
            latitude: Some(123.0),
            longitude: Some(-999.0),
            country_code: Some("US".into()),
            ..GeoInfo::default()
        };
        let ev = normalize_event(&raw, HASH, None, &geo, Some(200));
        assert_eq!(ev.screen_width, Some(10_000));
        assert_eq!(ev.screen_height, Some(0));
        assert_eq!(ev.latency_ms, Some(60_000));
        assert_eq!(ev.battery_level, Some(100.0));
        assert_eq!(ev.latitude, Some(90.0));
        assert_eq!(ev.longitude, Some(-180.0));
        assert_eq!(ev.risk_score, Some(100));
        assert_eq!(ev.interaction_type.as_deref(), Some("click"));
    }

    #[test]
    fn test_normalize_stamps_timestamp_when_absent() {
        let before = now_ms();
        let ev = normalize_event(&json!({"type": "event"}), HASH, None, &GeoInfo::default(), None);
        assert!(ev.timestamp_ms >= before);

        let explicit = normalize_event(
            &json!({"type": "event", "timestamp": 12345}),
            HASH,
            None,
            &GeoInfo::default(),
            None,
        );
        assert_eq!(explicit.timestamp_ms, 12_345);
    }

    #[test]
    fn test_ipv4_conversion() {
        assert_eq!(ipv4_to_u32("8.8.8.8".parse().ok()), 0x0808_0808);
        assert_eq!(ipv4_to_u32("0.0.0.1".parse().ok()), 1);
        assert_eq!(ipv4_to_u32("::1".parse().ok()), 0);
        assert_eq!(ipv4_to_u32(None), 0);
    }

    #[test]
    fn test_payload_truncation_respects_char_boundary() {
        let big = "é".repeat(MAX_PAYLOAD_BYTES);
        let raw = json!({ "type": "event", "blob": big });
        let ev = normalize_event(&raw, HASH, None, &GeoInfo::default(), None);
        assert!(ev.payload.len() <= MAX_PAYLOAD_BYTES);
        // Truncation never splits a UTF-8 sequence.
        assert!(std::str::from_utf8(ev.payload.as_bytes()).is_ok());
    }

    #[test]
    fn test_event_type_defaults() {
        let ev = normalize_event(&json!({}), HASH, None, &GeoInfo::default(), None);
        assert_eq!(ev.event_type, "event");
    }

    #[tokio::test]
    async fn test_flusher_discards_when_store_disabled() {
        let sink = Arc::new(EventSink::new());
        let store = Arc::new(EventLogStore::disabled(&crate::config::StoreSection::default()));
        for i in 0..5 {
            sink.enqueue(event(i));
        }
        flush_pending(&sink, &store).await;
        let stats = sink.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.dropped_total, 5);
    }

    #[tokio::test]
    async fn test_flusher_drains_on_shutdown_signal() {
        let sink = Arc::new(EventSink::new());
        let store = Arc::new(EventLogStore::disabled(&crate::config::StoreSection::default()));
        sink.enqueue(event(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_flusher(sink.clone(), store, shutdown_rx));
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(sink.stats().queued, 0);
        assert!(!sink.enqueue(event(1)), "sink refuses events after drain");
    }
}
