use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Settings;
use crate::error::GatewayError;

/// Consecutive probe failures before a member is taken out of rotation.
const FAILURES_TO_DEACTIVATE: u32 = 3;
/// Consecutive probe successes before it is put back.
const SUCCESSES_TO_REACTIVATE: u32 = 2;

/// Model role a pool serves. One pool per role; membership is fixed at
/// startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Chat,
    Text2sql,
    Embed,
    Rerank,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Chat => "chat",
            Role::Text2sql => "text2sql",
            Role::Embed => "embed",
            Role::Rerank => "rerank",
        }
    }
}

/// One backend base URL plus its probe-driven health state.
pub struct BackendMember {
    base_url: String,
    active: AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    last_failure_ms: AtomicU64,
}

impl BackendMember {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            active: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn record_probe_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let successes = self
            .consecutive_successes
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        if successes >= SUCCESSES_TO_REACTIVATE && !self.is_active() {
            self.active.store(true, Ordering::Relaxed);
            tracing::info!(backend = %self.base_url, "backend reactivated");
        }
    }

    pub fn record_probe_failure(&self) {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.last_failure_ms.store(now_millis(), Ordering::Relaxed);
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        if failures >= FAILURES_TO_DEACTIVATE && self.is_active() {
            self.active.store(false, Ordering::Relaxed);
            tracing::warn!(backend = %self.base_url, "backend deactivated");
        }
    }

    fn last_failure(&self) -> u64 {
        self.last_failure_ms.load(Ordering::Relaxed)
    }
}

/// Ordered members with an atomic round-robin cursor. Selection walks from
/// the cursor position to the first active member; with every member active
/// this degenerates to exact round-robin.
pub struct BackendPool {
    members: Vec<BackendMember>,
    cursor: AtomicUsize,
}

impl BackendPool {
    pub fn new(base_urls: Vec<String>) -> Self {
        Self {
            members: base_urls.into_iter().map(BackendMember::new).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[BackendMember] {
        &self.members
    }

    pub fn choose(&self) -> Option<&BackendMember> {
        if self.members.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.members.len() {
            let member = &self.members[(start.wrapping_add(offset)) % self.members.len()];
            if member.is_active() {
                return Some(member);
            }
        }
        // Nothing active: hand out the least recently failed member and let
        // the caller surface the upstream failure.
        self.members.iter().min_by_key(|member| member.last_failure())
    }
}

/// The four named pools, created once at startup.
pub struct BackendRegistry {
    chat: BackendPool,
    text2sql: BackendPool,
    embed: BackendPool,
    rerank: BackendPool,
}

impl BackendRegistry {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            chat: BackendPool::new(settings.chat_backends.clone()),
            text2sql: BackendPool::new(vec![settings.text2sql_backend.clone()]),
            embed: BackendPool::new(vec![settings.embed_backend.clone()]),
            rerank: BackendPool::new(vec![settings.rerank_backend.clone()]),
        }
    }

    pub fn pool(&self, role: Role) -> &BackendPool {
        match role {
            Role::Chat => &self.chat,
            Role::Text2sql => &self.text2sql,
            Role::Embed => &self.embed,
            Role::Rerank => &self.rerank,
        }
    }

    pub fn choose(&self, role: Role) -> Result<String, GatewayError> {
        self.pool(role)
            .choose()
            .map(|member| member.base_url().to_string())
            .ok_or(GatewayError::NoBackend {
                pool: role.as_str(),
            })
    }

    /// Every member across every pool, for the probe loop.
    pub fn all_members(&self) -> impl Iterator<Item = &BackendMember> {
        self.chat
            .members()
            .iter()
            .chain(self.text2sql.members())
            .chain(self.embed.members())
            .chain(self.rerank.members())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
