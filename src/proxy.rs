use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::OwnedSemaphorePermit;

use crate::config::Settings;
use crate::error::GatewayError;
use crate::observability::Observability;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_CONNECTIONS: usize = 800;

type UpstreamBodyStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Status and verbatim body of a completed unary upstream call. Upstream
/// error statuses ride through here unchanged.
pub struct UnaryOutcome {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Shared outbound HTTP client plus the per-request caps. One instance per
/// process; connections are pooled across all backends.
pub struct ProxyClient {
    client: reqwest::Client,
    backend_api_key: String,
    lifetime: Duration,
    stream_idle: Duration,
}

impl ProxyClient {
    /// The client carries a connect timeout only. An overall deadline here
    /// would act as a generation timeout, which the pipeline deliberately
    /// does not impose; the lifetime cap is enforced per call instead.
    pub fn new(settings: &Settings) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .build()?;
        Ok(Self {
            client,
            backend_api_key: settings.backend_api_key.clone(),
            lifetime: settings.max_request(),
            stream_idle: settings.stream_idle_timeout(),
        })
    }

    /// POST `payload` to `url` and return status plus body, the whole call
    /// bounded by the lifetime cap.
    pub async fn unary(&self, url: &str, payload: Bytes) -> Result<UnaryOutcome, GatewayError> {
        let call = async {
            let response = self
                .post_json(url, payload)
                .send()
                .await
                .map_err(GatewayError::upstream)?;
            let status = response.status();
            let body = response.bytes().await.map_err(GatewayError::upstream)?;
            Ok(UnaryOutcome { status, body })
        };

        match tokio::time::timeout(self.lifetime, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::LifetimeExceeded),
        }
    }

    /// POST `payload` to `url` and relay the response body chunk-for-chunk.
    ///
    /// Two caps govern the relay: the lifetime cap, checked before each
    /// chunk await, and the idle cap bounding each await itself. Both end
    /// the stream cleanly; the status is already committed, so the client
    /// sees a natural end of stream with no invented terminator. Chunk
    /// boundaries are preserved so `data: ...\n\n` records stay intact.
    ///
    /// The admission permit rides inside the response body; whichever way
    /// the stream ends (EOF, cap, client disconnect), dropping the body
    /// releases the slot and closes the upstream connection.
    pub async fn stream(
        &self,
        url: &str,
        payload: Bytes,
        permit: OwnedSemaphorePermit,
        observability: Arc<Observability>,
    ) -> Result<Response, GatewayError> {
        let started = Instant::now();
        let send = self.post_json(url, payload).send();
        let response = match tokio::time::timeout(self.lifetime, send).await {
            Err(_) => return Err(GatewayError::LifetimeExceeded),
            Ok(Err(err)) => return Err(GatewayError::upstream(err)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            // Upstream refused before streaming began; relay its answer as a
            // unary response. The permit drops with this early return.
            observability.record_upstream_error();
            let body = response.bytes().await.map_err(GatewayError::upstream)?;
            return Ok(json_response(status, body));
        }

        observability.record_stream_opened();
        let state = SseRelay {
            upstream: response.bytes_stream().boxed(),
            deadline: started + self.lifetime,
            idle: self.stream_idle,
            _guard: StreamGuard {
                _permit: permit,
                observability,
            },
        };

        let body = futures_util::stream::try_unfold(state, |mut state| async move {
            if Instant::now() >= state.deadline {
                tracing::debug!("stream lifetime cap reached");
                state._guard.observability.record_lifetime_expired();
                return Ok(None);
            }
            match tokio::time::timeout(state.idle, state.upstream.next()).await {
                Err(_) => {
                    tracing::debug!("stream idle cap reached");
                    Ok(None)
                }
                Ok(None) => Ok(None),
                Ok(Some(Ok(chunk))) => Ok(Some((chunk, state))),
                Ok(Some(Err(err))) => {
                    tracing::warn!(error = %err, "upstream stream error");
                    Ok::<_, std::io::Error>(None)
                }
            }
        });

        let mut response = Response::new(Body::from_stream(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        // Tells fronting proxies not to buffer the event stream.
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        Ok(response)
    }

    fn post_json(&self, url: &str, payload: Bytes) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .bearer_auth(&self.backend_api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(payload)
    }
}

/// Accounting attached to a live relay; drop-driven so client disconnects
/// are indistinguishable from clean ends.
struct StreamGuard {
    _permit: OwnedSemaphorePermit,
    observability: Arc<Observability>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.observability.record_stream_closed();
    }
}

struct SseRelay {
    upstream: UpstreamBodyStream,
    deadline: Instant,
    idle: Duration,
    _guard: StreamGuard,
}

/// Verbatim JSON passthrough of an upstream response.
pub fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
