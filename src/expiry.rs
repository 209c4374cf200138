//! Background expiry of stale requests.

use chrono::Duration;
use std::sync::Arc;
use tracing::info;

use crate::tracker::RequestTracker;

const SWEEP_INTERVAL_SECS: u64 = 60;

/// Periodically retire pending requests older than `ttl`. Runs forever; spawn
/// it on the runtime.
pub async fn expiry_sweep_loop(tracker: Arc<RequestTracker>, ttl: Duration) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
    // A missed tick (slow sweep) should not cause a burst of catch-up sweeps.
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(ttl_secs = ttl.num_seconds(), "expiry sweep started");

    loop {
        interval.tick().await;
        let expired = tracker.expire_stale(ttl).await;
        if expired > 0 {
            info!(expired, "expired stale requests");
        }
    }
}
