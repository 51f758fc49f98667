//! Consumer throughput counters.
//!
//! [`MetricsRegister`] is owned by a single consumer service and shared with its
//! message handler through an `Arc`. Counters are atomics, so handler invocations
//! running on different tasks never race.
//!
//! # Accounting Rules
//!
//! For every message that enters the handler:
//!
//! 1. [`MetricsRegister::record_received`] fires first
//! 2. then exactly one of [`MetricsRegister::record_processed`] or
//!    [`MetricsRegister::record_failed`], except for empty messages which get
//!    [`MetricsRegister::record_ignored`] and count as neither
//!
//! so `total_events >= processed_events + failed_events` always holds.
//!
//! Outcome counters are bumped with `Release` and read with `Acquire` before
//! `total_events` is loaded, so a reader on another thread never sees an
//! outcome without the receipt that preceded it.
//!
//! Each record call also bumps a counter on the [`metrics`](::metrics) facade;
//! those are no-ops unless a recorder is installed.

use crate::environment::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

const RECEIVED_TOTAL: &str = "consumer_events_received_total";
const PROCESSED_TOTAL: &str = "consumer_events_processed_total";
const FAILED_TOTAL: &str = "consumer_events_failed_total";
const IGNORED_TOTAL: &str = "consumer_events_ignored_total";

/// Sentinel for "no event processed yet".
const NO_EVENT: i64 = i64::MIN;

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    ::metrics::describe_counter!(RECEIVED_TOTAL, "Messages delivered to the handler");
    ::metrics::describe_counter!(PROCESSED_TOTAL, "Events processed successfully");
    ::metrics::describe_counter!(FAILED_TOTAL, "Messages that failed to decode or process");
    ::metrics::describe_counter!(IGNORED_TOTAL, "Messages skipped because the body was empty");
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerMetrics {
    /// Messages that entered the handler
    pub total_events: u64,
    /// Events the processor accepted
    pub processed_events: u64,
    /// Messages that failed to decode or process
    pub failed_events: u64,
    /// Time of the most recent successfully processed event
    pub last_event_time: Option<DateTime<Utc>>,
    /// Time the register was created
    pub start_time: DateTime<Utc>,
}

/// Counters merged with the consumer's connection flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Counter values
    #[serde(flatten)]
    pub counters: ConsumerMetrics,
    /// Whether a broker session is established
    pub is_connected: bool,
    /// Whether the consume loop is running
    pub is_consuming: bool,
}

impl MetricsSnapshot {
    /// Time elapsed between `start_time` and `now`, clamped at zero.
    #[must_use]
    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        (now - self.counters.start_time).to_std().unwrap_or_default()
    }
}

/// Process-lifetime counters for one consumer service.
pub struct MetricsRegister {
    total_events: AtomicU64,
    processed_events: AtomicU64,
    failed_events: AtomicU64,
    last_event_millis: AtomicI64,
    start_time: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl MetricsRegister {
    /// Create a register stamped with the current wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a register that reads time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            total_events: AtomicU64::new(0),
            processed_events: AtomicU64::new(0),
            failed_events: AtomicU64::new(0),
            last_event_millis: AtomicI64::new(NO_EVENT),
            start_time: clock.now(),
            clock,
        }
    }

    /// Count a message entering the handler.
    pub fn record_received(&self) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!(RECEIVED_TOTAL).increment(1);
    }

    /// Count a successfully processed event and stamp `last_event_time`.
    pub fn record_processed(&self) {
        self.processed_events.fetch_add(1, Ordering::Release);
        self.last_event_millis
            .store(self.clock.now().timestamp_millis(), Ordering::Relaxed);
        ::metrics::counter!(PROCESSED_TOTAL).increment(1);
    }

    /// Count a message that failed to decode or process.
    pub fn record_failed(&self) {
        self.failed_events.fetch_add(1, Ordering::Release);
        ::metrics::counter!(FAILED_TOTAL).increment(1);
    }

    /// Note an empty message; it is neither processed nor failed.
    pub fn record_ignored(&self) {
        ::metrics::counter!(IGNORED_TOTAL).increment(1);
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn counters(&self) -> ConsumerMetrics {
        // Outcomes first: total is loaded last so it can only be ahead of them.
        let failed_events = self.failed_events.load(Ordering::Acquire);
        let processed_events = self.processed_events.load(Ordering::Acquire);
        let total_events = self.total_events.load(Ordering::Relaxed);
        let last = self.last_event_millis.load(Ordering::Relaxed);

        ConsumerMetrics {
            total_events,
            processed_events,
            failed_events,
            last_event_time: (last != NO_EVENT)
                .then(|| DateTime::from_timestamp_millis(last))
                .flatten(),
            start_time: self.start_time,
        }
    }

    /// Copy the counters together with the given connection flags.
    #[must_use]
    pub fn snapshot(&self, is_connected: bool, is_consuming: bool) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters(),
            is_connected,
            is_consuming,
        }
    }

    /// Current time according to the register's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for MetricsRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegister")
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}
