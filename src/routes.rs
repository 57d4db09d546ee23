use crate::registry::Role;

/// Whether a public endpoint may stream. Unary rows ignore the payload's
/// `stream` flag but still forward it verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMode {
    Unary,
    StreamCapable,
}

/// One row of the route table: public endpoint → backend pool + upstream
/// path. The table is fixed; axum owns the method/path matching and unknown
/// paths fall through to 404.
#[derive(Clone, Copy, Debug)]
pub struct RouteSpec {
    pub role: Role,
    pub upstream_path: &'static str,
    pub mode: RouteMode,
}

pub const CHAT_COMPLETIONS: RouteSpec = RouteSpec {
    role: Role::Chat,
    upstream_path: "/v1/chat/completions",
    mode: RouteMode::StreamCapable,
};

pub const TEXT2SQL: RouteSpec = RouteSpec {
    role: Role::Text2sql,
    upstream_path: "/v1/chat/completions",
    mode: RouteMode::StreamCapable,
};

pub const EMBEDDINGS: RouteSpec = RouteSpec {
    role: Role::Embed,
    upstream_path: "/v1/embeddings",
    mode: RouteMode::Unary,
};

pub const RERANK: RouteSpec = RouteSpec {
    role: Role::Rerank,
    upstream_path: "/rerank",
    mode: RouteMode::Unary,
};

impl RouteSpec {
    /// Effective dispatch mode for a concrete payload: streaming only when
    /// the route allows it and the body carries `"stream": true`. The body
    /// is parsed here once and nowhere else; a non-JSON body falls back to
    /// unary and the backend rejects it.
    pub fn wants_stream(&self, body: &[u8]) -> bool {
        if self.mode != RouteMode::StreamCapable {
            return false;
        }
        serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|payload| payload.get("stream").and_then(|flag| flag.as_bool()))
            .unwrap_or(false)
    }
}
