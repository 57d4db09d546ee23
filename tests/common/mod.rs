#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use parapet::{GatewayHttpState, Settings};

pub const GATEWAY_KEY: &str = "gateway-key";
pub const BACKEND_KEY: &str = "backend-key";

/// Settings with all required keys filled in and health probes disabled;
/// overrides win. The default backends point at a closed port, so tests
/// that never reach upstream keep working.
pub fn settings(overrides: &[(&str, &str)]) -> Settings {
    let mut env: HashMap<String, String> = HashMap::from([
        ("GATEWAY_API_KEY".to_string(), GATEWAY_KEY.to_string()),
        ("BACKEND_API_KEY".to_string(), BACKEND_KEY.to_string()),
        ("CHAT_BACKENDS".to_string(), "http://127.0.0.1:9".to_string()),
        ("TEXT2SQL_BACKEND".to_string(), "http://127.0.0.1:9".to_string()),
        ("EMBED_BACKEND".to_string(), "http://127.0.0.1:9".to_string()),
        ("RERANK_BACKEND".to_string(), "http://127.0.0.1:9".to_string()),
        ("HEALTH_INTERVAL_SECS".to_string(), "0".to_string()),
    ]);
    for (key, value) in overrides {
        env.insert((*key).to_string(), (*value).to_string());
    }
    Settings::from_lookup(|key| env.get(key).cloned()).expect("test settings")
}

/// Serve the gateway on an ephemeral port; returns the bound address and a
/// state handle for poking at admission internals.
pub async fn spawn_gateway(settings: &Settings) -> (SocketAddr, GatewayHttpState) {
    let state = GatewayHttpState::from_settings(settings).expect("gateway state");
    let app = parapet::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("gateway addr");
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    (addr, state)
}

/// A fake SSE backend: answers POST /v1/chat/completions with the given
/// chunks, sleeping each chunk's delay before emitting it.
pub async fn spawn_sse_stub(chunks: Vec<(Duration, &'static str)>) -> SocketAddr {
    let handler = move || {
        let chunks = chunks.clone();
        async move {
            let stream = futures_util::stream::iter(chunks).then(|(delay, data)| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(Bytes::from_static(data.as_bytes()))
            });
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(stream))
                .expect("stub response")
        }
    };
    let app = Router::new().route("/v1/chat/completions", post(handler));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

pub fn gateway_client() -> reqwest::Client {
    reqwest::Client::builder()
        .build()
        .expect("test http client")
}
