use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::BackendRegistry;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe every backend's `/health` endpoint on a fixed period and feed the
/// results into the registry's activation hysteresis. Returns `None` when
/// probing is disabled (`HEALTH_INTERVAL_SECS=0`); members then stay active
/// and failures surface to clients as 502s. The HTTP state owns the handle
/// and aborts it when the last clone drops.
pub fn spawn_health_probes(
    registry: Arc<BackendRegistry>,
    interval_secs: u64,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }

    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .ok()?;
    let period = Duration::from_secs(interval_secs);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for member in registry.all_members() {
                let url = format!("{}/health", member.base_url());
                match client.get(&url).send().await {
                    Ok(response) if response.status().is_success() => {
                        member.record_probe_success();
                    }
                    Ok(response) => {
                        tracing::debug!(
                            backend = %member.base_url(),
                            status = %response.status(),
                            "health probe failed"
                        );
                        member.record_probe_failure();
                    }
                    Err(err) => {
                        tracing::debug!(
                            backend = %member.base_url(),
                            error = %err,
                            "health probe failed"
                        );
                        member.record_probe_failure();
                    }
                }
            }
        }
    });

    Some(task)
}
