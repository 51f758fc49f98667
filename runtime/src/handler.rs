//! Per-message decode and dispatch with fault isolation.
//!
//! [`MessageHandler`] is the [`MessageSink`] the broker's consume loop calls once
//! per delivered message. Nothing that goes wrong inside it escapes: decode and
//! processing failures are logged, counted, and swallowed so the loop always moves
//! on to the next message.
//!
//! # Pipeline
//!
//! ```text
//! record_received
//!       │
//!       ├── empty body ─────────────► warn, Ignored
//!       │
//!   decode JSON ── error ───────────► record_failed, DecodeFailed
//!       │
//!   log event
//!       │
//!   processor.process ── error/panic ► record_failed, ProcessingFailed
//!       │
//!   record_processed ───────────────► Processed
//! ```
//!
//! The handler does not retry. A failed message is consumed and its offset
//! advances like any other.

use affiliate_consumer_core::broker::MessageSink;
use affiliate_consumer_core::error::ConsumerError;
use affiliate_consumer_core::event::{InboundMessage, PixelEvent};
use affiliate_consumer_core::metrics::MetricsRegister;
use affiliate_consumer_core::processor::{EventProcessor, ProcessingFailure};
use crate::shutdown::catch_isolated;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Body was empty; neither processed nor failed
    Ignored,
    /// Body could not be decoded into an event
    DecodeFailed,
    /// Processor rejected the event or panicked
    ProcessingFailed,
    /// Processor accepted the event
    Processed,
}

/// Decodes inbound messages and hands them to an [`EventProcessor`].
pub struct MessageHandler {
    metrics: Arc<MetricsRegister>,
    processor: Arc<dyn EventProcessor>,
}

impl MessageHandler {
    /// Create a handler that records into `metrics` and dispatches to `processor`.
    #[must_use]
    pub fn new(metrics: Arc<MetricsRegister>, processor: Arc<dyn EventProcessor>) -> Self {
        Self { metrics, processor }
    }

    /// Handle one message to completion.
    pub async fn handle(&self, message: &InboundMessage) -> HandleOutcome {
        self.metrics.record_received();
        let meta = &message.meta;

        let body = match message.payload.as_deref() {
            Some(body) if !body.is_empty() => body,
            _ => {
                warn!(
                    topic = %meta.topic,
                    partition = meta.partition,
                    offset = meta.offset,
                    "Received empty message"
                );
                self.metrics.record_ignored();
                return HandleOutcome::Ignored;
            }
        };

        let event = match PixelEvent::from_slice(body) {
            Ok(event) => event,
            Err(source) => {
                let err = ConsumerError::Decode {
                    topic: meta.topic.clone(),
                    partition: meta.partition,
                    offset: meta.offset,
                    source,
                };
                self.metrics.record_failed();
                error!(
                    topic = %meta.topic,
                    partition = meta.partition,
                    offset = meta.offset,
                    message_key = ?meta.key,
                    body_len = body.len(),
                    error = %err,
                    "Failed to decode message"
                );
                return HandleOutcome::DecodeFailed;
            }
        };

        info!(
            topic = %meta.topic,
            partition = meta.partition,
            offset = meta.offset,
            event_id = %event.id,
            event_type = %event.topic,
            shop = %event.shop,
            webhook_id = %event.webhook_id,
            timestamp = %event.timestamp,
            api_version = %event.api_version,
            payload = %serde_json::Value::Object(event.payload.clone()),
            message_headers = ?meta.headers,
            message_key = ?meta.key,
            message_timestamp = ?meta.timestamp,
            "Consumed analytics event"
        );

        let result = catch_isolated(self.processor.process(&event))
            .await
            .unwrap_or_else(|panic| {
                Err(ProcessingFailure::new(format!("processor panicked: {panic}")))
            });

        if let Err(source) = result {
            let err = ConsumerError::Processing {
                event_id: event.id.clone(),
                source,
            };
            self.metrics.record_failed();
            error!(
                topic = %meta.topic,
                partition = meta.partition,
                offset = meta.offset,
                event_id = %event.id,
                event_type = %event.topic,
                shop = %event.shop,
                error = %err,
                error_context = ?err,
                "Failed to process event"
            );
            return HandleOutcome::ProcessingFailed;
        }

        self.metrics.record_processed();
        HandleOutcome::Processed
    }
}

#[async_trait]
impl MessageSink for MessageHandler {
    async fn on_message(&self, message: InboundMessage) {
        self.handle(&message).await;
    }
}
