//! Periodic metrics log line.

use crate::service::ConsumerService;
use affiliate_consumer_core::metrics::MetricsSnapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info};

/// Log `snapshot` as one structured "Consumer metrics" record.
pub fn log_snapshot(snapshot: &MetricsSnapshot, now: DateTime<Utc>) {
    let counters = &snapshot.counters;
    let uptime_ms = u64::try_from(snapshot.uptime(now).as_millis()).unwrap_or(u64::MAX);

    info!(
        total_events = counters.total_events,
        processed_events = counters.processed_events,
        failed_events = counters.failed_events,
        last_event_time = ?counters.last_event_time.map(|t| t.to_rfc3339()),
        start_time = %counters.start_time.to_rfc3339(),
        uptime_ms,
        is_connected = snapshot.is_connected,
        is_consuming = snapshot.is_consuming,
        "Consumer metrics"
    );
}

/// Spawn a task that logs the service's metrics every `every` until `shutdown` fires.
///
/// The first record is written one full interval after spawning.
#[must_use]
pub fn spawn_metrics_reporter(
    service: Arc<ConsumerService>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let report = async move {
        let start = tokio::time::Instant::now() + every;
        let mut ticker = tokio::time::interval_at(start, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = service.metrics_register().now();
                    log_snapshot(&service.metrics(), now);
                }
                _ = shutdown.recv() => {
                    debug!("Metrics reporter stopped");
                    return;
                }
            }
        }
    };

    tokio::spawn(report.in_current_span())
}
