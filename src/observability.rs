use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time counter values, rendered as JSON by `GET /metrics`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub rate_limited: u64,
    pub queue_rejected: u64,
    pub quota_rejected: u64,
    pub backend_calls: u64,
    pub upstream_errors: u64,
    pub lifetime_expired: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
}

/// Process-wide counters. Plain relaxed atomics; the snapshot is advisory
/// and never needs cross-counter consistency.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    rate_limited: AtomicU64,
    queue_rejected: AtomicU64,
    quota_rejected: AtomicU64,
    backend_calls: AtomicU64,
    upstream_errors: AtomicU64,
    lifetime_expired: AtomicU64,
    streams_opened: AtomicU64,
    streams_closed: AtomicU64,
}

impl Observability {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_rejected(&self) {
        self.queue_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_rejected(&self) {
        self.quota_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_call(&self) {
        self.backend_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lifetime_expired(&self) {
        self.lifetime_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_closed(&self) {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            queue_rejected: self.queue_rejected.load(Ordering::Relaxed),
            quota_rejected: self.quota_rejected.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            lifetime_expired: self.lifetime_expired.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
        }
    }
}
