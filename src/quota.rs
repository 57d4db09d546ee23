use async_trait::async_trait;

use crate::error::GatewayError;

/// Seam for org-level usage accounting beyond rate and concurrency. The
/// orchestrator consults `check` after a slot is acquired and reports
/// `usage.total_tokens` from unary responses via `record`. Streaming
/// responses are not metered.
#[async_trait]
pub trait QuotaHook: Send + Sync {
    async fn check(&self, key: &str) -> Result<(), GatewayError>;
    async fn record(&self, key: &str, total_tokens: u64);
}

/// Default hook: admit everything, account nothing.
#[derive(Debug, Default)]
pub struct NoQuota;

#[async_trait]
impl QuotaHook for NoQuota {
    async fn check(&self, _key: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn record(&self, _key: &str, _total_tokens: u64) {}
}
