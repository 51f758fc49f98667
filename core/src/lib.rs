//! # Affiliate Consumer Core
//!
//! Core types and traits for the affiliate analytics consumer.
//!
//! This crate provides the pieces every other crate in the workspace shares:
//!
//! - **Event model**: [`event::PixelEvent`] decoded from one broker message, plus
//!   the [`event::DeliveryMeta`] coordinates it arrived with
//! - **Broker seam**: the [`broker::BrokerClient`] trait implemented by the
//!   rdkafka adapter and by the in-memory test broker
//! - **Processor seam**: the [`processor::EventProcessor`] capability that turns a
//!   decoded event into durable action
//! - **Metrics**: the [`metrics::MetricsRegister`] counters owned by a service
//! - **Errors**: the [`error::ConsumerError`] taxonomy
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   InboundMessage   ┌────────────────┐   PixelEvent   ┌────────────────┐
//! │ BrokerClient │ ─────────────────► │  MessageSink   │ ─────────────► │ EventProcessor │
//! └──────────────┘                    └───────┬────────┘                └────────────────┘
//!                                             │ record_*
//!                                             ▼
//!                                     ┌────────────────┐
//!                                     │MetricsRegister │
//!                                     └────────────────┘
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod broker;
pub mod error;
pub mod event;
pub mod metrics;
pub mod processor;

/// Environment module - injected dependencies for testability.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use affiliate_consumer_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

/// Build the single topic name consumed by this service.
///
/// Topics follow the pattern `{topic_prefix}-analytics-events`, where the
/// prefix is environment specific (e.g. `saleshq`, `staging`).
///
/// # Example
///
/// ```
/// assert_eq!(
///     affiliate_consumer_core::analytics_topic("saleshq"),
///     "saleshq-analytics-events"
/// );
/// ```
#[must_use]
pub fn analytics_topic(topic_prefix: &str) -> String {
    format!("{topic_prefix}-analytics-events")
}
