//! Integration tests for the admin HTTP API: authentication totality,
//! validation, shaping actions, and read surfaces. All against a real
//! server on an ephemeral port with an in-memory bus and no stores.

use serde_json::{json, Value};
use spindle::config::Config;
use spindle::registry::SessionMode;
use spindle::server::startup::{run_server_with_config, ServerConfig, ServerHandle};

const API_KEY: &str = "test-key";
const HASH: &str = "abcdef0123456789abcdef0123456789";

fn test_config() -> Config {
    let mut config = Config::default();
    config.admin.api_key = API_KEY.to_string();
    config
}

async fn start_test_server() -> ServerHandle {
    run_server_with_config(ServerConfig::for_testing(test_config()))
        .await
        .unwrap()
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

// ---------------------------------------------------------------------------
// Auth totality: every /admin route rejects a wrong or absent key
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auth_totality() {
    let handle = start_test_server().await;
    let base = handle.base_url();
    let client = client();

    let gets = [
        format!("{base}/admin/sessions"),
        format!("{base}/admin/sessions/{HASH}"),
        format!("{base}/admin/analytics"),
        format!("{base}/admin/high-risk"),
        format!("{base}/admin/stats"),
    ];
    let posts = [
        format!("{base}/admin/sessions/{HASH}/upspin"),
        format!("{base}/admin/sessions/{HASH}/downspin"),
        format!("{base}/admin/sessions/{HASH}/terminate"),
        format!("{base}/admin/sessions/{HASH}/notify"),
        format!("{base}/admin/sessions/{HASH}/redirect"),
        format!("{base}/admin/batch-action"),
    ];

    for url in &gets {
        let missing = client.get(url).send().await.unwrap();
        assert_eq!(missing.status(), 401, "GET {url} without key");
        let wrong = client
            .get(url)
            .header("X-API-Key", "nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401, "GET {url} with wrong key");
        let body: Value = wrong.json().await.unwrap();
        assert_eq!(body["error"], "Unauthorized");
    }
    for url in &posts {
        let missing = client.post(url).json(&json!({})).send().await.unwrap();
        assert_eq!(missing.status(), 401, "POST {url} without key");
        let wrong = client
            .post(url)
            .header("X-API-Key", "nope")
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401, "POST {url} with wrong key");
    }

    // No state was touched by any of those calls.
    assert!(handle.state.registry.get(HASH).is_none());
    assert_eq!(handle.state.registry.session_count(), 0);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_validation_errors() {
    let handle = start_test_server().await;
    let base = handle.base_url();
    let client = client();

    // Bad session hash format.
    let resp = client
        .post(format!("{base}/admin/sessions/NOT-A-HASH/upspin"))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // notify without message.
    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/notify"))
        .header("X-API-Key", API_KEY)
        .json(&json!({ "type": "info" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("message"));

    // redirect without url, and with a non-http scheme.
    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/redirect"))
        .header("X-API-Key", API_KEY)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/redirect"))
        .header("X-API-Key", API_KEY)
        .json(&json!({ "url": "javascript:alert(1)" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // downspin with a negative latency.
    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/downspin"))
        .header("X-API-Key", API_KEY)
        .json(&json!({ "latency_ms": -5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // batch-action with an unknown action.
    let resp = client
        .post(format!("{base}/admin/batch-action"))
        .header("X-API-Key", API_KEY)
        .json(&json!({ "action": "explode", "sessionHashes": [HASH] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // No command was published for any of the rejected calls.
    assert_eq!(handle.state.bus.stats().published, 0);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Shaping actions and the sticky terminal state
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_downspin_then_upspin() {
    let handle = start_test_server().await;
    let base = handle.base_url();
    let client = client();

    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/downspin"))
        .header("X-API-Key", API_KEY)
        .json(&json!({ "latency_ms": 2000 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["sessionHash"], HASH);
    assert_eq!(body["latency_ms"], 2000);
    assert_eq!(body["command"]["type"], "SET_LATENCY");
    assert_eq!(body["command"]["payload"]["latency_ms"], 2000);
    assert!(body["command"]["id"].as_str().unwrap().len() > 10);

    let snap = handle.state.registry.get(HASH).unwrap();
    assert_eq!(snap.mode, SessionMode::Downspin);
    assert_eq!(snap.current_latency_ms, 2000);

    // upspin forces latency back to zero.
    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/upspin"))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let snap = handle.state.registry.get(HASH).unwrap();
    assert_eq!(snap.mode, SessionMode::Upspin);
    assert_eq!(snap.current_latency_ms, 0);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_is_sticky() {
    let handle = start_test_server().await;
    let base = handle.base_url();
    let client = client();

    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/terminate"))
        .header("X-API-Key", API_KEY)
        .json(&json!({ "reason": "abuse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["command"]["type"], "TERMINATE");
    assert_eq!(body["command"]["payload"]["reason"], "abuse");

    let published_after_terminate = handle.state.bus.stats().published;

    // A later upspin must not change state and must emit no command.
    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/upspin"))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "terminated");

    let snap = handle.state.registry.get(HASH).unwrap();
    assert_eq!(snap.mode, SessionMode::Terminated);
    assert_eq!(
        handle.state.bus.stats().published,
        published_after_terminate,
        "no command may be published for a terminated session"
    );

    // notify and redirect are refused too.
    let resp = client
        .post(format!("{base}/admin/sessions/{HASH}/notify"))
        .header("X-API-Key", API_KEY)
        .json(&json!({ "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Batch actions
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_action() {
    let handle = start_test_server().await;
    let base = handle.base_url();
    let client = client();

    let other = "ffffffffffffffffffffffffffffffff";
    let resp = client
        .post(format!("{base}/admin/batch-action"))
        .header("X-API-Key", API_KEY)
        .json(&json!({
            "action": "downspin",
            "sessionHashes": [HASH, other, "bogus"],
            "payload": { "latency_ms": 1500 },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["count"], 3);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[1]["success"], true);
    assert_eq!(results[2]["success"], false);

    for hash in [HASH, other] {
        let snap = handle.state.registry.get(hash).unwrap();
        assert_eq!(snap.mode, SessionMode::Downspin);
        assert_eq!(snap.current_latency_ms, 1500);
    }

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Read surfaces
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sessions_and_detail_reads() {
    let handle = start_test_server().await;
    let base = handle.base_url();
    let client = client();

    // Unknown session: 404.
    let resp = client
        .get(format!("{base}/admin/sessions/{HASH}"))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Create one through a shaping action, then read it back.
    client
        .post(format!("{base}/admin/sessions/{HASH}/downspin"))
        .header("X-API-Key", API_KEY)
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{base}/admin/sessions?minutes=60"))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["count"], 1);
    assert_eq!(body["sessions"][0]["sessionHash"], HASH);

    let resp = client
        .get(format!("{base}/admin/sessions/{HASH}"))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["session"]["sessionHash"], HASH);
    assert_eq!(body["session"]["mode"], "downspin");
    assert!(body["timeline"].is_array());
    assert!(body["commands"].is_array());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stats_shape() {
    let handle = start_test_server().await;
    let base = handle.base_url();

    let resp = client()
        .get(format!("{base}/admin/stats"))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["websocket"]["totalConnections"].is_number());
    assert!(body["websocket"]["activeConnections"].is_number());
    assert!(body["websocket"]["rateLimiter"]["activeBuckets"].is_number());
    assert!(body["online"].is_number());
    assert!(body["timestamp"].is_number());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_analytics_degrades_without_stores() {
    let handle = start_test_server().await;
    let base = handle.base_url();

    let resp = client()
        .get(format!("{base}/admin/analytics?hours=24"))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["geoDistribution"].is_array());
    assert!(body["botCandidates"].is_array());
    assert!(body.get("summary").is_some());
    assert!(body.get("dbStats").is_some());

    handle.shutdown().await;
}
