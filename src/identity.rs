use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Derive the org-level client key for a request.
///
/// The leftmost `X-Forwarded-For` token wins; the fronting proxy is trusted
/// to overwrite that header, so a NATed organization collapses into one key.
/// Without the header the peer IP is used, and `unknown` as a last resort.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}
