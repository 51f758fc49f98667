//! # Affiliate Consumer Testing
//!
//! Testing utilities and helpers for the affiliate analytics consumer.
//!
//! This crate provides:
//! - Mock implementations of the core traits ([`mocks`], [`broker`])
//! - Canned events and messages ([`fixtures`])
//! - Test logging setup ([`init_test_tracing`]) and log capture ([`logs`])
//!
//! ## Example
//!
//! ```ignore
//! use affiliate_consumer_testing::{broker::InMemoryBroker, fixtures, mocks::RecordingProcessor};
//!
//! #[tokio::test]
//! async fn processes_one_event() {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let processor = Arc::new(RecordingProcessor::new());
//!     let service = ConsumerService::new(config(), broker.clone(), processor.clone());
//!
//!     service.connect().await?;
//!     service.start_consuming().await?;
//!     broker.deliver(fixtures::message_for(&fixtures::sample_event(), 0, 42)).await;
//!
//!     assert_eq!(processor.events().len(), 1);
//! }
//! ```

pub mod broker;
pub mod fixtures;
pub mod logs;

/// Mock implementations for testing.
pub mod mocks {
    use affiliate_consumer_core::environment::Clock;
    use affiliate_consumer_core::event::PixelEvent;
    use affiliate_consumer_core::processor::{EventProcessor, ProcessingFailure};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use affiliate_consumer_testing::mocks::FixedClock;
    /// use affiliate_consumer_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }

    /// Processor that records every event it is given and succeeds.
    #[derive(Debug, Default)]
    pub struct RecordingProcessor {
        events: Mutex<Vec<PixelEvent>>,
    }

    impl RecordingProcessor {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Events processed so far, in call order.
        #[must_use]
        pub fn events(&self) -> Vec<PixelEvent> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl EventProcessor for RecordingProcessor {
        async fn process(&self, event: &PixelEvent) -> Result<(), ProcessingFailure> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            Ok(())
        }
    }

    /// Processor that rejects every event.
    #[derive(Debug)]
    pub struct FailingProcessor {
        reason: String,
        attempts: AtomicUsize,
    }

    impl FailingProcessor {
        /// Create a processor failing with `reason`.
        #[must_use]
        pub fn new(reason: impl Into<String>) -> Self {
            Self {
                reason: reason.into(),
                attempts: AtomicUsize::new(0),
            }
        }

        /// Number of `process` calls so far.
        #[must_use]
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventProcessor for FailingProcessor {
        async fn process(&self, _event: &PixelEvent) -> Result<(), ProcessingFailure> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ProcessingFailure::new(self.reason.clone()))
        }
    }

    /// Processor that panics on its first `panics` calls and accepts the rest.
    #[derive(Debug)]
    pub struct PanickingProcessor {
        panics: usize,
        calls: AtomicUsize,
    }

    impl PanickingProcessor {
        /// Create a processor that panics `panics` times before recovering.
        #[must_use]
        pub fn new(panics: usize) -> Self {
            Self {
                panics,
                calls: AtomicUsize::new(0),
            }
        }

        /// Number of calls that returned normally.
        #[must_use]
        pub fn accepted(&self) -> usize {
            self.calls.load(Ordering::SeqCst).saturating_sub(self.panics)
        }
    }

    #[allow(clippy::panic)]
    #[async_trait]
    impl EventProcessor for PanickingProcessor {
        async fn process(&self, event: &PixelEvent) -> Result<(), ProcessingFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.panics {
                panic!("processor blew up on event {}", event.id);
            }
            Ok(())
        }
    }
}

/// Install a test-friendly tracing subscriber, ignoring repeat installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use affiliate_consumer_core::environment::Clock;
    use affiliate_consumer_core::processor::EventProcessor;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn recording_processor_keeps_order() {
        let processor = mocks::RecordingProcessor::new();
        let mut second = fixtures::sample_event();
        second.id = "e2".to_string();

        tokio_test::block_on(async {
            assert!(processor.process(&fixtures::sample_event()).await.is_ok());
            assert!(processor.process(&second).await.is_ok());
        });

        let ids: Vec<_> = processor.events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn failing_processor_counts_attempts() {
        let processor = mocks::FailingProcessor::new("nope");

        tokio_test::block_on(async {
            let err = processor.process(&fixtures::sample_event()).await;
            assert_eq!(err.map_err(|e| e.message().to_string()), Err("nope".to_string()));
        });

        assert_eq!(processor.attempts(), 1);
    }
}
