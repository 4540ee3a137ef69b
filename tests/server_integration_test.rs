//! Integration tests for the server startup / shutdown lifecycle.
//!
//! Each test spins up a real server on an ephemeral port via
//! [`run_server_with_config`], exercises it, and shuts it down cleanly.

use spindle::config::Config;
use spindle::server::startup::{run_server_with_config, ServerConfig, ServerHandle};

fn test_config() -> Config {
    let mut config = Config::default();
    config.admin.api_key = "test-key".to_string();
    config
}

/// Spin up a lightweight test server: in-memory bus, no stores.
async fn start_test_server() -> ServerHandle {
    run_server_with_config(ServerConfig::for_testing(test_config()))
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// 1. Server starts and binds to a real port
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_starts_and_binds() {
    let handle = start_test_server().await;
    assert_ne!(handle.port(), 0, "OS should assign a non-zero port");
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Health endpoint responds with the aggregate body
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint_responds() {
    let handle = start_test_server().await;
    let url = format!("{}/health", handle.base_url());

    let resp = reqwest::get(&url).await.expect("GET /health failed");
    // No stores configured: everything counts healthy.
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["healthy"], true);
    assert_eq!(body["redis"], true);
    assert_eq!(body["clickhouse"], true);
    assert_eq!(body["postgres"], true);
    assert!(body.get("uptime").is_some());
    assert!(body.get("timestamp").is_some());

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Non-existent route returns 404
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonexistent_route_returns_404() {
    let handle = start_test_server().await;
    let url = format!("{}/does-not-exist", handle.base_url());

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 404);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. WebSocket upgrade responds with 101
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ws_upgrade_responds_101() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let handle = start_test_server().await;
    let addr = handle.local_addr();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(
        response.contains("101"),
        "expected 101 Switching Protocols, got: {response}"
    );

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Two servers can run side by side on separate ports
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_servers_coexist() {
    let handle_a = start_test_server().await;
    let handle_b = start_test_server().await;
    assert_ne!(handle_a.port(), handle_b.port());

    let resp_a = reqwest::get(format!("{}/health", handle_a.base_url()))
        .await
        .unwrap();
    let resp_b = reqwest::get(format!("{}/health", handle_b.base_url()))
        .await
        .unwrap();
    assert_eq!(resp_a.status(), 200);
    assert_eq!(resp_b.status(), 200);

    handle_a.shutdown().await;
    handle_b.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Beacon endpoint always answers 204
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_beacon_always_204() {
    let handle = start_test_server().await;
    let url = format!("{}/beacon", handle.base_url());
    let client = reqwest::Client::new();

    // Well-formed body.
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "events": [
                { "type": "event", "sessionHash": "abcdef0123456789abcdef0123456789" }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // Malformed bodies get the same answer.
    for body in ["{broken", "", "[1,2,3]", "null"] {
        let resp = client.post(&url).body(body).send().await.unwrap();
        assert_eq!(resp.status(), 204, "beacon must 204 for body {body:?}");
    }

    // The well-formed event lands in the sink shortly after the response.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(handle.state.sink.stats().enqueued_total, 1);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. Ingress rate limit kicks in per client IP
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ingress_rate_limit() {
    let mut config = test_config();
    config.ingress.requests_per_minute = 3;
    config.ingress.exempt_loopback = false;
    let handle = run_server_with_config(ServerConfig::for_testing(config))
        .await
        .unwrap();
    let url = format!("{}/health", handle.base_url());

    for _ in 0..3 {
        assert_eq!(reqwest::get(&url).await.unwrap().status(), 200);
    }
    let limited = reqwest::get(&url).await.unwrap();
    assert_eq!(limited.status(), 429);
    assert!(limited.headers().get("retry-after").is_some());

    handle.shutdown().await;
}
