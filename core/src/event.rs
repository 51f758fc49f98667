//! Analytics event model and delivery metadata.
//!
//! A [`PixelEvent`] is the unit of work: one storefront analytics event produced by
//! the webhook ingestion service and carried as the JSON body of one broker message.
//! Events are decoded once, never mutated, and dropped after processing.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "id": "e1",
//!   "topic": "page_viewed",
//!   "shop": "s.myshopify.com",
//!   "payload": { "url": "/p/1" },
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "apiVersion": "2025-01",
//!   "webhookId": "w1"
//! }
//! ```
//!
//! All seven keys are required. `payload` must be a JSON object but has no fixed
//! schema: code handling events must not assume any key exists.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Error returned when a message body cannot be decoded into a [`PixelEvent`].
#[derive(Error, Debug)]
#[error("Failed to decode analytics event: {0}")]
pub struct DecodeFailure(#[from] serde_json::Error);

/// One decoded analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelEvent {
    /// Unique identifier assigned by the producer
    pub id: String,
    /// Logical event type (e.g. `page_viewed`), not the broker topic name
    pub topic: String,
    /// Tenant (shop domain) the event belongs to
    pub shop: String,
    /// Open, schema-less event body
    pub payload: Map<String, Value>,
    /// Producer-assigned ISO-8601 timestamp
    pub timestamp: String,
    /// Upstream API version the event was produced against
    pub api_version: String,
    /// Webhook delivery identifier
    pub webhook_id: String,
}

impl PixelEvent {
    /// Decode an event from a raw message body.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeFailure`] if the body is not valid UTF-8 JSON, a required
    /// field is missing, or `payload` is not an object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeFailure> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Keys present in the payload, in sorted order.
    #[must_use]
    pub fn payload_keys(&self) -> Vec<&str> {
        self.payload.keys().map(String::as_str).collect()
    }

    /// Size in bytes of the payload when re-encoded as compact JSON.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map_or(0, |bytes| bytes.len())
    }
}

/// Coordinates and envelope data for one broker delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryMeta {
    /// Broker topic the message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Partition-local offset
    pub offset: i64,
    /// Message key, lossily decoded as UTF-8
    pub key: Option<String>,
    /// Message headers, lossily decoded as UTF-8
    pub headers: BTreeMap<String, String>,
    /// Broker timestamp in milliseconds since the epoch
    pub timestamp: Option<i64>,
}

impl DeliveryMeta {
    /// Create delivery metadata with only the coordinates set.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            ..Self::default()
        }
    }
}

/// A raw message as handed over by a [`crate::broker::BrokerClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Where the message came from
    pub meta: DeliveryMeta,
    /// Raw body, if any
    pub payload: Option<Vec<u8>>,
}

impl InboundMessage {
    /// Create a new inbound message.
    #[must_use]
    pub const fn new(meta: DeliveryMeta, payload: Option<Vec<u8>>) -> Self {
        Self { meta, payload }
    }

    /// `true` when the body is absent or zero-length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.as_deref().is_none_or(<[u8]>::is_empty)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{
        "id": "e1",
        "topic": "page_viewed",
        "shop": "s.myshopify.com",
        "payload": {"url": "/p/1"},
        "timestamp": "2024-01-01T00:00:00Z",
        "apiVersion": "2025-01",
        "webhookId": "w1"
    }"#;

    #[test]
    fn decodes_camel_case_wire_format() {
        let event = PixelEvent::from_slice(SAMPLE.as_bytes()).unwrap();

        assert_eq!(event.id, "e1");
        assert_eq!(event.topic, "page_viewed");
        assert_eq!(event.shop, "s.myshopify.com");
        assert_eq!(event.api_version, "2025-01");
        assert_eq!(event.webhook_id, "w1");
        assert_eq!(event.payload.get("url"), Some(&json!("/p/1")));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let body = r#"{"id":"e1","topic":"page_viewed","shop":"s","payload":{},"timestamp":"t","apiVersion":"v"}"#;
        assert!(PixelEvent::from_slice(body.as_bytes()).is_err());
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let body = r#"{"id":"e1","topic":"t","shop":"s","payload":[1,2],"timestamp":"t","apiVersion":"v","webhookId":"w"}"#;
        assert!(PixelEvent::from_slice(body.as_bytes()).is_err());
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        assert!(PixelEvent::from_slice(b"{not json").is_err());
        assert!(PixelEvent::from_slice(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn payload_helpers_do_not_assume_keys() {
        let mut event = PixelEvent::from_slice(SAMPLE.as_bytes()).unwrap();
        assert_eq!(event.payload_keys(), vec!["url"]);
        assert_eq!(event.payload_size(), r#"{"url":"/p/1"}"#.len());

        event.payload.clear();
        assert!(event.payload_keys().is_empty());
        assert_eq!(event.payload_size(), 2);
    }

    #[test]
    fn empty_message_detection() {
        let meta = DeliveryMeta::new("saleshq-analytics-events", 0, 43);

        assert!(InboundMessage::new(meta.clone(), None).is_empty());
        assert!(InboundMessage::new(meta.clone(), Some(Vec::new())).is_empty());
        assert!(!InboundMessage::new(meta, Some(b"{}".to_vec())).is_empty());
    }
}
