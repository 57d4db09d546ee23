use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Settings;
use crate::error::GatewayError;
use crate::limits::RateWindow;

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub window: Duration,
    pub allowed: usize,
    pub max_inflight: usize,
    pub queue_timeout: Duration,
    pub idle_horizon: Duration,
}

impl AdmissionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            window: settings.rps_window(),
            allowed: settings.rps_allowed(),
            max_inflight: settings.max_inflight_per_ip.max(1),
            queue_timeout: settings.queue_timeout(),
            idle_horizon: settings.ip_idle(),
        }
    }
}

struct ClientEntry {
    window: RateWindow,
    slots: Arc<Semaphore>,
    last_seen: Instant,
}

impl ClientEntry {
    fn new(max_inflight: usize, now: Instant) -> Self {
        Self {
            window: RateWindow::default(),
            slots: Arc::new(Semaphore::new(max_inflight)),
            last_seen: now,
        }
    }
}

/// Per-client admission state: rate window, concurrency slots, and the
/// last-seen stamp the reaper reads. One map lock guards everything; every
/// contended section is a hash lookup plus O(bounded) window maintenance.
pub struct AdmissionManager {
    clients: Mutex<HashMap<String, ClientEntry>>,
    config: AdmissionConfig,
}

impl AdmissionManager {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Sliding-window rate check for `key`. Creates the client entry on
    /// first contact and touches its last-seen stamp either way.
    pub async fn check_rate(&self, key: &str) -> Result<(), GatewayError> {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let entry = self.entry(&mut clients, key, now);
        entry.last_seen = now;
        entry.window.check(now, self.config.window, self.config.allowed)
    }

    /// Take one concurrency slot for `key`, waiting at most the queue
    /// timeout. The returned permit releases its slot when dropped, so every
    /// exit path (completion, error, disconnect, panic) gives the slot back
    /// exactly once. Cancelling the wait consumes nothing.
    pub async fn acquire(&self, key: &str) -> Result<OwnedSemaphorePermit, GatewayError> {
        let slots = {
            let now = Instant::now();
            let mut clients = self.clients.lock().await;
            let entry = self.entry(&mut clients, key, now);
            entry.last_seen = now;
            Arc::clone(&entry.slots)
        };

        match tokio::time::timeout(self.config.queue_timeout, slots.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(GatewayError::ConcurrencyOverflow),
        }
    }

    /// Drop state for clients idle past the horizon. Clients holding slots
    /// are skipped: held permits mean in-flight work, and evicting the entry
    /// would let a reconnecting client double its concurrency cap.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, entry| {
            let idle = now.duration_since(entry.last_seen) > self.config.idle_horizon;
            let in_flight = entry.slots.available_permits() < self.config.max_inflight;
            !idle || in_flight
        });
        before - clients.len()
    }

    pub async fn tracked_clients(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Slots currently held by `key`; zero for unknown keys.
    pub async fn held_slots(&self, key: &str) -> usize {
        let clients = self.clients.lock().await;
        clients
            .get(key)
            .map(|entry| self.config.max_inflight - entry.slots.available_permits())
            .unwrap_or(0)
    }

    fn entry<'a>(
        &self,
        clients: &'a mut HashMap<String, ClientEntry>,
        key: &str,
        now: Instant,
    ) -> &'a mut ClientEntry {
        clients
            .entry(key.to_string())
            .or_insert_with(|| ClientEntry::new(self.config.max_inflight, now))
    }
}

/// Run the state reaper until the returned task is aborted. The HTTP state
/// owns the handle and aborts it when the last clone drops.
pub fn spawn_reaper(manager: Arc<AdmissionManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = manager.reap_idle().await;
            if removed > 0 {
                tracing::debug!(removed, "evicted idle client state");
            }
        }
    })
}
