//! Inference gateway: per-client admission control and a streaming proxy in
//! front of pools of OpenAI-compatible model backends.

pub mod admission;
pub mod config;
mod error;
pub mod health;
pub mod http;
pub mod identity;
pub mod limits;
pub mod observability;
pub mod proxy;
pub mod quota;
pub mod registry;
pub mod routes;

pub use config::{ConfigError, Settings};
pub use error::{GatewayError, Result};
pub use http::{router, GatewayHttpState};
