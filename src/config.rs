use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Process configuration, read once at startup. A missing required key or a
/// malformed value is fatal (the binary exits with code 1).
#[derive(Clone, Debug)]
pub struct Settings {
    pub gateway_api_key: String,
    pub backend_api_key: String,

    pub chat_backends: Vec<String>,
    pub text2sql_backend: String,
    pub embed_backend: String,
    pub rerank_backend: String,

    pub max_rps_per_ip: f64,
    pub rps_window_secs: f64,
    pub rps_burst: usize,

    pub max_inflight_per_ip: usize,
    pub queue_timeout_secs: f64,

    pub max_request_secs: f64,
    pub stream_idle_timeout_secs: f64,

    pub ip_idle_secs: f64,
    pub reaper_period_secs: u64,
    pub health_interval_secs: u64,

    pub listen_addr: SocketAddr,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. `from_env` is the only
    /// production caller; tests feed closures over maps.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        fn parse<T: std::str::FromStr>(
            key: &'static str,
            raw: Option<String>,
            default: T,
        ) -> Result<T, ConfigError> {
            match raw {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { key, value }),
            }
        }

        let chat_backends: Vec<String> = required("CHAT_BACKENDS")?
            .split(',')
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if chat_backends.is_empty() {
            return Err(ConfigError::Missing("CHAT_BACKENDS"));
        }

        let single_backend = |key: &'static str| -> Result<String, ConfigError> {
            Ok(required(key)?.trim_end_matches('/').to_string())
        };

        let listen_raw =
            lookup("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let listen_addr = listen_raw.parse().map_err(|_| ConfigError::Invalid {
            key: "LISTEN_ADDR",
            value: listen_raw,
        })?;

        Ok(Self {
            gateway_api_key: required("GATEWAY_API_KEY")?,
            backend_api_key: required("BACKEND_API_KEY")?,
            chat_backends,
            text2sql_backend: single_backend("TEXT2SQL_BACKEND")?,
            embed_backend: single_backend("EMBED_BACKEND")?,
            rerank_backend: single_backend("RERANK_BACKEND")?,
            max_rps_per_ip: parse("MAX_RPS_PER_IP", lookup("MAX_RPS_PER_IP"), 50.0)?,
            rps_window_secs: parse("RPS_WINDOW_SECS", lookup("RPS_WINDOW_SECS"), 1.0)?,
            rps_burst: parse("RPS_BURST", lookup("RPS_BURST"), 100)?,
            max_inflight_per_ip: parse(
                "MAX_INFLIGHT_PER_IP",
                lookup("MAX_INFLIGHT_PER_IP"),
                120,
            )?,
            queue_timeout_secs: parse(
                "QUEUE_TIMEOUT_SECS",
                lookup("QUEUE_TIMEOUT_SECS"),
                2.0,
            )?,
            max_request_secs: parse("MAX_REQUEST_SECS", lookup("MAX_REQUEST_SECS"), 5400.0)?,
            stream_idle_timeout_secs: parse(
                "STREAM_IDLE_TIMEOUT_SECS",
                lookup("STREAM_IDLE_TIMEOUT_SECS"),
                180.0,
            )?,
            ip_idle_secs: parse("IP_IDLE_SECS", lookup("IP_IDLE_SECS"), 900.0)?,
            reaper_period_secs: parse(
                "REAPER_PERIOD_SECS",
                lookup("REAPER_PERIOD_SECS"),
                60,
            )?,
            health_interval_secs: parse(
                "HEALTH_INTERVAL_SECS",
                lookup("HEALTH_INTERVAL_SECS"),
                10,
            )?,
            listen_addr,
        })
    }

    pub fn rps_window(&self) -> Duration {
        Duration::from_secs_f64(self.rps_window_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.queue_timeout_secs)
    }

    pub fn max_request(&self) -> Duration {
        Duration::from_secs_f64(self.max_request_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stream_idle_timeout_secs)
    }

    pub fn ip_idle(&self) -> Duration {
        Duration::from_secs_f64(self.ip_idle_secs)
    }

    /// Effective per-window admission count; the burst floor keeps short
    /// windows from rounding the allowance down to zero.
    pub fn rps_allowed(&self) -> usize {
        let windowed = (self.max_rps_per_ip * self.rps_window_secs).floor() as usize;
        self.rps_burst.max(windowed)
    }

    /// Retry-After value advertised on queue-timeout rejections.
    pub fn queue_retry_after_secs(&self) -> u64 {
        (self.queue_timeout_secs.ceil() as u64).max(1)
    }
}
