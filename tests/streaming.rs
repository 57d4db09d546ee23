mod common;

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::json;

const STREAM_PAYLOAD: &str = r#"{"model":"m","messages":[],"stream":true}"#;

async fn open_stream(addr: std::net::SocketAddr) -> reqwest::Response {
    common::gateway_client()
        .post(format!("http://{addr}/v1/chat/completions"))
        .bearer_auth(common::GATEWAY_KEY)
        .header("content-type", "application/json")
        .body(STREAM_PAYLOAD)
        .send()
        .await
        .expect("open stream")
}

async fn collect_body(response: reqwest::Response) -> String {
    let mut stream = response.bytes_stream();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.expect("stream chunk"));
    }
    String::from_utf8(collected).expect("utf8 body")
}

/// Poll until the client's slots drain or the budget runs out.
async fn wait_for_release(state: &parapet::GatewayHttpState, key: &str) -> bool {
    for _ in 0..20 {
        if state.admission().held_slots(key).await == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn sse_records_relay_in_order_with_event_stream_content_type() {
    let stub = common::spawn_sse_stub(vec![
        (Duration::from_millis(0), "data: A\n\n"),
        (Duration::from_millis(20), "data: B\n\n"),
        (Duration::from_millis(20), "data: [DONE]\n\n"),
    ])
    .await;

    let backend = format!("http://{stub}");
    let settings = common::settings(&[("CHAT_BACKENDS", backend.as_str())]);
    let (addr, state) = common::spawn_gateway(&settings).await;

    let response = open_stream(addr).await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = collect_body(response).await;
    assert_eq!(body, "data: A\n\ndata: B\n\ndata: [DONE]\n\n");
    assert!(wait_for_release(&state, "127.0.0.1").await);
}

#[tokio::test]
async fn idle_cap_ends_the_stream_cleanly_and_frees_the_slot() {
    let stub = common::spawn_sse_stub(vec![
        (Duration::from_millis(0), "data: A\n\n"),
        (Duration::from_secs(10), "data: B\n\n"),
    ])
    .await;

    let backend = format!("http://{stub}");
    let settings = common::settings(&[
        ("CHAT_BACKENDS", backend.as_str()),
        ("STREAM_IDLE_TIMEOUT_SECS", "0.3"),
        ("MAX_INFLIGHT_PER_IP", "1"),
    ]);
    let (addr, state) = common::spawn_gateway(&settings).await;

    let start = Instant::now();
    let response = open_stream(addr).await;
    let body = collect_body(response).await;
    let elapsed = start.elapsed();

    // The stalled second chunk never arrives; the stream ends without an
    // error marker once the silence cap fires.
    assert_eq!(body, "data: A\n\n");
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(3));
    assert!(wait_for_release(&state, "127.0.0.1").await);
}

#[tokio::test]
async fn stream_lifetime_cap_truncates_long_generations() {
    let chunks: Vec<(Duration, &'static str)> =
        std::iter::repeat((Duration::from_millis(100), "data: tick\n\n"))
            .take(30)
            .collect();
    let stub = common::spawn_sse_stub(chunks).await;

    let backend = format!("http://{stub}");
    let settings = common::settings(&[
        ("CHAT_BACKENDS", backend.as_str()),
        ("MAX_REQUEST_SECS", "0.5"),
    ]);
    let (addr, state) = common::spawn_gateway(&settings).await;

    let start = Instant::now();
    let response = open_stream(addr).await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = collect_body(response).await;
    let elapsed = start.elapsed();

    let ticks = body.matches("data: tick").count();
    assert!(ticks >= 1);
    assert!(ticks < 30);
    assert!(elapsed < Duration::from_secs(3));
    assert!(wait_for_release(&state, "127.0.0.1").await);
}

#[tokio::test]
async fn client_disconnect_releases_the_slot_and_upstream() {
    let stub = common::spawn_sse_stub(vec![
        (Duration::from_millis(0), "data: A\n\n"),
        (Duration::from_secs(30), "data: B\n\n"),
    ])
    .await;

    let backend = format!("http://{stub}");
    let settings = common::settings(&[
        ("CHAT_BACKENDS", backend.as_str()),
        ("MAX_INFLIGHT_PER_IP", "1"),
    ]);
    let (addr, state) = common::spawn_gateway(&settings).await;

    let mut response = open_stream(addr).await;
    let first = response.chunk().await.expect("first chunk");
    assert!(first.is_some());
    assert_eq!(state.admission().held_slots("127.0.0.1").await, 1);

    drop(response);
    assert!(wait_for_release(&state, "127.0.0.1").await);
}

#[tokio::test]
async fn held_streams_make_new_requests_queue_and_reject() {
    let stub = common::spawn_sse_stub(vec![
        (Duration::from_millis(0), "data: A\n\n"),
        (Duration::from_secs(30), "data: B\n\n"),
    ])
    .await;

    let backend = format!("http://{stub}");
    let settings = common::settings(&[
        ("CHAT_BACKENDS", backend.as_str()),
        ("MAX_INFLIGHT_PER_IP", "1"),
        ("QUEUE_TIMEOUT_SECS", "0.3"),
    ]);
    let (addr, _state) = common::spawn_gateway(&settings).await;

    let mut held = open_stream(addr).await;
    let _ = held.chunk().await.expect("first chunk");

    let start = Instant::now();
    let rejected = common::gateway_client()
        .post(format!("http://{addr}/v1/chat/completions"))
        .bearer_auth(common::GATEWAY_KEY)
        .json(&json!({"model": "m", "messages": []}))
        .send()
        .await
        .expect("second request");
    let waited = start.elapsed();

    assert_eq!(rejected.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert!(waited >= Duration::from_millis(300));
    assert!(waited < Duration::from_secs(3));
    assert_eq!(rejected.headers().get("retry-after").unwrap(), "1");
}

#[tokio::test]
async fn upstream_refusal_before_streaming_is_relayed_as_unary() {
    // Backend that 404s the chat path: the stub only mounts the chat route,
    // so aim the pool at a path-less URL by using an httpmock-style refusal
    // via a plain axum 404 from the stub's router fallback.
    let stub = common::spawn_sse_stub(vec![]).await;

    let backend = format!("http://{stub}/missing");
    let settings = common::settings(&[("CHAT_BACKENDS", backend.as_str())]);
    let (addr, state) = common::spawn_gateway(&settings).await;

    let response = open_stream(addr).await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_ne!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(state.observability().upstream_errors, 1);
}
