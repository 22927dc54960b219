//! Idle-eviction monitor.
//!
//! Every `scan_period` the monitor takes the worker-table write lock, stops
//! and removes each worker that has processed at least one sample and has been
//! idle for longer than `expiry`, and publishes `WorkerExpired`. A worker that
//! has never processed a sample is never evicted. The next sample for an
//! evicted key creates a fresh worker.

use super::dispatcher::Shared;
use super::events::PipelineEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default inactivity threshold before a worker is evicted.
pub const DEFAULT_IDLE_EXPIRY: Duration = Duration::from_secs(10 * 60);
/// Default time between scans.
pub const DEFAULT_IDLE_SCAN_PERIOD: Duration = Duration::from_secs(60);

/// When idle workers are reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdlePolicy {
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
    #[serde(with = "humantime_serde")]
    pub scan_period: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            expiry: DEFAULT_IDLE_EXPIRY,
            scan_period: DEFAULT_IDLE_SCAN_PERIOD,
        }
    }
}

pub(crate) async fn run(shared: Arc<Shared>, policy: IdlePolicy, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + policy.scan_period, policy.scan_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        expiry = ?policy.expiry,
        scan_period = ?policy.scan_period,
        "Idle monitor started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let expired = evict_idle(&shared, policy.expiry).await;
        if expired > 0 {
            tracing::info!(expired, "Evicted idle key workers");
        }
    }
}

/// One scan. Returns the number of workers evicted.
pub(crate) async fn evict_idle(shared: &Shared, expiry: Duration) -> usize {
    let mut workers = shared.workers.write().await;
    let now = Instant::now();

    let expired: Vec<_> = workers
        .iter()
        .filter(|(_, worker)| worker.is_idle(now, expiry))
        .map(|(key, _)| *key)
        .collect();

    for key in &expired {
        if let Some(worker) = workers.remove(key) {
            let worker_id = worker.id();
            let processed = worker.processed();
            worker.stop().await;
            tracing::debug!(key, worker_id, processed, "Key worker expired");
            shared
                .sink
                .emit(PipelineEvent::WorkerExpired { key: *key, worker_id });
        }
    }

    expired.len()
}
