use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::admission::{spawn_reaper, AdmissionConfig, AdmissionManager};
use crate::config::Settings;
use crate::error::GatewayError;
use crate::health::spawn_health_probes;
use crate::identity;
use crate::observability::{Observability, ObservabilitySnapshot};
use crate::proxy::{json_response, ProxyClient};
use crate::quota::{NoQuota, QuotaHook};
use crate::registry::{BackendRegistry, Role};
use crate::routes::{self, RouteSpec};

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// The gateway's background loops (reaper, health probes). Owned by the
/// shared state; when the last clone drops, the loops are aborted with it.
struct BackgroundTasks(Vec<tokio::task::JoinHandle<()>>);

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Shared state behind every handler. Construction wires the whole pipeline
/// and starts the background loops; dropping the last clone stops them.
#[derive(Clone)]
pub struct GatewayHttpState {
    gateway_api_key: Arc<str>,
    queue_retry_after_secs: u64,
    admission: Arc<AdmissionManager>,
    registry: Arc<BackendRegistry>,
    proxy: Arc<ProxyClient>,
    observability: Arc<Observability>,
    quota: Arc<dyn QuotaHook>,
    _background: Arc<BackgroundTasks>,
}

impl GatewayHttpState {
    pub fn from_settings(settings: &Settings) -> reqwest::Result<Self> {
        let admission = Arc::new(AdmissionManager::new(AdmissionConfig::from_settings(
            settings,
        )));
        let registry = Arc::new(BackendRegistry::from_settings(settings));
        let proxy = Arc::new(ProxyClient::new(settings)?);

        let mut background = vec![spawn_reaper(
            Arc::clone(&admission),
            Duration::from_secs(settings.reaper_period_secs.max(1)),
        )];
        if let Some(probes) =
            spawn_health_probes(Arc::clone(&registry), settings.health_interval_secs)
        {
            background.push(probes);
        }

        Ok(Self {
            gateway_api_key: settings.gateway_api_key.as_str().into(),
            queue_retry_after_secs: settings.queue_retry_after_secs(),
            admission,
            registry,
            proxy,
            observability: Arc::new(Observability::default()),
            quota: Arc::new(NoQuota),
            _background: Arc::new(BackgroundTasks(background)),
        })
    }

    pub fn with_quota_hook(mut self, hook: Arc<dyn QuotaHook>) -> Self {
        self.quota = hook;
        self
    }

    pub fn admission(&self) -> &AdmissionManager {
        &self.admission
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// Record the rejection and render it. Counters first, so the metrics
    /// surface never undercounts what clients were told.
    fn reject(&self, err: GatewayError, key: &str) -> Response {
        match &err {
            GatewayError::RateLimited => {
                self.observability.record_rate_limited();
                tracing::warn!(client = %key, "rate limit exceeded");
            }
            GatewayError::ConcurrencyOverflow => {
                self.observability.record_queue_rejected();
                tracing::warn!(client = %key, "admission queue timeout");
            }
            GatewayError::QuotaExceeded => {
                self.observability.record_quota_rejected();
                tracing::warn!(client = %key, "quota exceeded");
            }
            GatewayError::LifetimeExceeded => {
                self.observability.record_lifetime_expired();
                tracing::warn!(client = %key, "request exceeded max lifetime");
            }
            GatewayError::Upstream { message } => {
                self.observability.record_upstream_error();
                tracing::warn!(client = %key, error = %message, "upstream error");
            }
            GatewayError::NoBackend { pool } => {
                self.observability.record_upstream_error();
                tracing::warn!(client = %key, pool = %pool, "no backend available");
            }
            GatewayError::AuthMissing | GatewayError::AuthInvalid => {}
        }
        map_gateway_error(err, self.queue_retry_after_secs)
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/text2sql", post(text2sql))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .fallback(not_found)
        .with_state(state)
}

async fn chat_completions(State(state): State<GatewayHttpState>, request: Request) -> Response {
    dispatch(state, request, routes::CHAT_COMPLETIONS).await
}

async fn text2sql(State(state): State<GatewayHttpState>, request: Request) -> Response {
    dispatch(state, request, routes::TEXT2SQL).await
}

async fn embeddings(State(state): State<GatewayHttpState>, request: Request) -> Response {
    dispatch(state, request, routes::EMBEDDINGS).await
}

async fn rerank(State(state): State<GatewayHttpState>, request: Request) -> Response {
    dispatch(state, request, routes::RERANK).await
}

/// The admission orchestrator: auth, identity, rate, slot, quota, route,
/// proxy. The slot permit is an RAII handle (scoped here for unary calls,
/// owned by the response body for streams), so release happens exactly once
/// on every exit path, framework cleanup or not.
async fn dispatch(state: GatewayHttpState, request: Request, route: RouteSpec) -> Response {
    state.observability.record_request();
    let (parts, body) = request.into_parts();

    if let Err(err) = require_api_key(&parts.headers, &state.gateway_api_key) {
        return state.reject(err, "-");
    }

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = identity::client_key(&parts.headers, peer);

    if let Err(err) = state.admission.check_rate(&key).await {
        return state.reject(err, &key);
    }

    let permit = match state.admission.acquire(&key).await {
        Ok(permit) => permit,
        Err(err) => return state.reject(err, &key),
    };

    if let Err(err) = state.quota.check(&key).await {
        return state.reject(err, &key);
    }

    let payload = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let base = match state.registry.choose(route.role) {
        Ok(base) => base,
        Err(err) => return state.reject(err, &key),
    };
    let url = format!("{base}{}", route.upstream_path);
    let streaming = route.wants_stream(&payload);

    state.observability.record_backend_call();
    tracing::debug!(
        client = %key,
        pool = route.role.as_str(),
        backend = %base,
        streaming,
        "dispatching upstream"
    );

    if streaming {
        match state
            .proxy
            .stream(&url, payload, permit, Arc::clone(&state.observability))
            .await
        {
            Ok(response) => response,
            Err(err) => state.reject(err, &key),
        }
    } else {
        match state.proxy.unary(&url, payload).await {
            Ok(outcome) => {
                // Passed-through upstream failures count too, not just
                // transport errors.
                if outcome.status.is_client_error() || outcome.status.is_server_error() {
                    state.observability.record_upstream_error();
                }
                state
                    .quota
                    .record(&key, total_tokens_from(&outcome.body))
                    .await;
                json_response(outcome.status, outcome.body)
            }
            Err(err) => state.reject(err, &key),
        }
    }
}

fn require_api_key(headers: &HeaderMap, expected: &str) -> Result<(), GatewayError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(GatewayError::AuthMissing)?;
    if token != expected {
        return Err(GatewayError::AuthInvalid);
    }
    Ok(())
}

fn total_tokens_from(body: &[u8]) -> u64 {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|payload| {
            payload
                .get("usage")
                .and_then(|usage| usage.get("total_tokens"))
                .and_then(|tokens| tokens.as_u64())
        })
        .unwrap_or(0)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: &'static str,
}

fn detail_response(status: StatusCode, detail: &'static str) -> Response {
    (status, Json(ErrorBody { detail })).into_response()
}

fn retry_after(mut response: Response, secs: u64) -> Response {
    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn map_gateway_error(err: GatewayError, queue_retry_after_secs: u64) -> Response {
    match err {
        GatewayError::AuthMissing => StatusCode::UNAUTHORIZED.into_response(),
        GatewayError::AuthInvalid => StatusCode::FORBIDDEN.into_response(),
        GatewayError::RateLimited => retry_after(
            detail_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded"),
            1,
        ),
        GatewayError::ConcurrencyOverflow => retry_after(
            detail_response(
                StatusCode::TOO_MANY_REQUESTS,
                "Too many concurrent requests from this org IP",
            ),
            queue_retry_after_secs,
        ),
        GatewayError::QuotaExceeded => retry_after(
            detail_response(StatusCode::TOO_MANY_REQUESTS, "Quota exceeded"),
            1,
        ),
        GatewayError::LifetimeExceeded => detail_response(
            StatusCode::GATEWAY_TIMEOUT,
            "Request exceeded max lifetime",
        ),
        GatewayError::NoBackend { .. } => detail_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No healthy backends available",
        ),
        GatewayError::Upstream { message } => {
            let body = serde_json::json!({ "detail": message });
            let mut response = Response::new(Body::from(body.to_string()));
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    chat_backends: usize,
}

/// Liveness only; never probes backends, so it answers fast even when the
/// pools are on fire.
async fn health(State(state): State<GatewayHttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        chat_backends: state.registry.pool(Role::Chat).len(),
    })
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    counters: ObservabilitySnapshot,
    tracked_clients: usize,
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        counters: state.observability.snapshot(),
        tracked_clients: state.admission.tracked_clients().await,
    })
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn api_key_validation_distinguishes_missing_from_wrong() {
        assert!(matches!(
            require_api_key(&HeaderMap::new(), "secret"),
            Err(GatewayError::AuthMissing)
        ));

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(matches!(
            require_api_key(&basic, "secret"),
            Err(GatewayError::AuthMissing)
        ));

        assert!(matches!(
            require_api_key(&bearer("wrong"), "secret"),
            Err(GatewayError::AuthInvalid)
        ));
        assert!(require_api_key(&bearer("secret"), "secret").is_ok());
    }

    #[test]
    fn usage_tokens_parse_and_default_to_zero() {
        assert_eq!(
            total_tokens_from(br#"{"usage":{"total_tokens":42}}"#),
            42
        );
        assert_eq!(total_tokens_from(br#"{"choices":[]}"#), 0);
        assert_eq!(total_tokens_from(b"not json"), 0);
    }
}
