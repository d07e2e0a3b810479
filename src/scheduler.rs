use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Keep `horizon_days` of slots materialized and prune the ended empty ones.
/// The first tick fires immediately, so a fresh start has slots right away.
pub async fn run_regenerator(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let horizon = engine.config().horizon_days;
    loop {
        interval.tick().await;
        match engine.run_regeneration(horizon).await {
            Ok(report) => {
                tracing::debug!("regeneration: {} created, {} pruned", report.created, report.pruned);
            }
            Err(e) => tracing::error!("slot regeneration failed: {e}"),
        }
        metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(engine.slot_count() as f64);
    }
}

/// Periodic no-show sweep and waitlist expiry.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

async fn sweep_once(engine: &Engine) {
    let now = engine.now();
    if let Err(e) = engine.sweep_no_shows(now).await {
        tracing::error!("no-show sweep failed: {e}");
    }
    if let Err(e) = engine.expire_waitlists(now).await {
        tracing::error!("waitlist expiry failed: {e}");
    }
    let pruned = engine.notify.prune();
    if pruned > 0 {
        tracing::debug!("dropped {pruned} idle notification channels");
    }
}

/// Compact the WAL whenever more than `threshold` events were appended since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
