use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use atmo_core::{Event, EventBus};

use crate::capability::CapabilityTable;

/// Shortest period a background ticker runs at.
pub const MIN_TICK: Duration = Duration::from_secs(1);

/// `requested`, or [`MIN_TICK`] when it is zero. `tokio::time::interval`
/// panics on a zero period.
pub fn tick_period(requested: Duration, task: &str) -> Duration {
    if requested.is_zero() {
        warn!(task, period_ms = MIN_TICK.as_millis() as u64, "zero period requested, using minimum");
        MIN_TICK
    } else {
        requested
    }
}

/// Periodically evict stale capability entries until `cancel` fires.
///
/// Runs independently of gossip traffic, so entries of peers that vanished
/// without a Goodbye still age out.
pub fn spawn_sweeper(
    table: Arc<CapabilityTable>,
    interval: Duration,
    ttl: Duration,
    events: EventBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = tick_period(interval, "capability sweeper");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), ttl_secs = ttl.as_secs(), "capability sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("capability sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = table.sweep(chrono::Utc::now(), ttl);
                    if evicted > 0 {
                        info!(evicted, remaining = table.len(), "evicted stale capabilities");
                        events.publish(Event::CapabilitiesEvicted { count: evicted });
                    }
                }
            }
        }
    })
}
