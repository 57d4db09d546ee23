use thiserror::Error;

/// Everything the request pipeline can reject or fail with. Variants map
/// one-to-one onto downstream HTTP statuses; see `http::map_gateway_error`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing bearer token")]
    AuthMissing,
    #[error("invalid api key")]
    AuthInvalid,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("too many concurrent requests")]
    ConcurrencyOverflow,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("request exceeded max lifetime")]
    LifetimeExceeded,
    #[error("no backend available for pool {pool}")]
    NoBackend { pool: &'static str },
    #[error("upstream error: {message}")]
    Upstream { message: String },
}

impl GatewayError {
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Self::Upstream {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
