//! Pluggable event processing.
//!
//! [`EventProcessor`] is the consumer's only extension point for turning a decoded
//! [`PixelEvent`] into durable action. The processor is injected into the message
//! handler at construction; [`LoggingProcessor`] is the reference variant and
//! persists nothing.
//!
//! # Example
//!
//! ```rust,ignore
//! use affiliate_consumer_core::processor::{EventProcessor, ProcessingFailure};
//! use async_trait::async_trait;
//!
//! struct WarehouseProcessor { /* client */ }
//!
//! #[async_trait]
//! impl EventProcessor for WarehouseProcessor {
//!     async fn process(&self, event: &PixelEvent) -> Result<(), ProcessingFailure> {
//!         self.client.insert(event).await.map_err(ProcessingFailure::from_error)
//!     }
//! }
//! ```

use crate::event::PixelEvent;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Failure reported by an [`EventProcessor`].
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ProcessingFailure {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProcessingFailure {
    /// Create a failure from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it as the source.
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }

    /// Human-readable failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Capability that acts on one decoded event.
///
/// Implementations own their timeout and backpressure policy; the handler awaits
/// `process` without a deadline.
#[async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    /// Process a single event.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingFailure`] if the event could not be processed. The
    /// handler counts the message as failed and moves on.
    async fn process(&self, event: &PixelEvent) -> Result<(), ProcessingFailure>;
}

/// Reference processor: logs the event and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProcessor;

#[async_trait]
impl EventProcessor for LoggingProcessor {
    async fn process(&self, event: &PixelEvent) -> Result<(), ProcessingFailure> {
        info!(
            event_id = %event.id,
            event_type = %event.topic,
            shop = %event.shop,
            webhook_id = %event.webhook_id,
            payload_keys = ?event.payload_keys(),
            payload_size = event.payload_size(),
            "Processing analytics event"
        );

        info!(
            event_id = %event.id,
            event_type = %event.topic,
            shop = %event.shop,
            "Event processed successfully"
        );

        Ok(())
    }
}
