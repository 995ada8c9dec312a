//! Periodic removal of executed dedup keys.

use chrono::{DateTime, Utc};
use marksign_core::StoreError;
use marksign_core::dedup::DedupStore;
use marksign_core::environment::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delete keys executed more than `retention` before the clock's now.
///
/// # Errors
///
/// Propagates the store's error.
pub async fn purge_once(
    store: &dyn DedupStore,
    clock: &dyn Clock,
    retention: Duration,
) -> Result<u64, StoreError> {
    let cutoff = cutoff(clock.now(), retention);
    let purged = store.purge_executed_before(cutoff).await?;
    debug!(%cutoff, purged, "Dedup purge finished");
    Ok(purged)
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Purge every `interval` until the task is dropped.
///
/// Failures are logged and retried on the next tick.
pub async fn run(
    store: Arc<dyn DedupStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    retention: Duration,
) {
    info!(
        interval_secs = interval.as_secs(),
        retention_secs = retention.as_secs(),
        "Dedup purge scheduled"
    );
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = purge_once(store.as_ref(), clock.as_ref(), retention).await {
            warn!(error = %e, "Dedup purge failed");
        }
    }
}
