//! Canned events and broker messages.

use affiliate_consumer_core::event::{DeliveryMeta, InboundMessage, PixelEvent};
use serde_json::{Map, Value};

/// Topic the fixtures pretend to be delivered from.
pub const TEST_TOPIC: &str = "test-analytics-events";

/// The `page_viewed` event used throughout the test suite.
#[must_use]
pub fn sample_event() -> PixelEvent {
    let mut payload = Map::new();
    payload.insert("url".to_string(), Value::String("/p/1".to_string()));

    PixelEvent {
        id: "e1".to_string(),
        topic: "page_viewed".to_string(),
        shop: "s.myshopify.com".to_string(),
        payload,
        timestamp: "2024-01-01T00:00:00Z".to_string(),
        api_version: "2025-01".to_string(),
        webhook_id: "w1".to_string(),
    }
}

/// Delivery metadata with a key, one header, and a broker timestamp.
#[must_use]
pub fn meta(partition: i32, offset: i64) -> DeliveryMeta {
    let mut meta = DeliveryMeta::new(TEST_TOPIC, partition, offset);
    meta.key = Some("s.myshopify.com".to_string());
    meta.headers
        .insert("x-shopify-topic".to_string(), "page_viewed".to_string());
    meta.timestamp = Some(1_704_067_200_000);
    meta
}

/// A message whose body is `event` encoded as JSON.
#[must_use]
pub fn message_for(event: &PixelEvent, partition: i32, offset: i64) -> InboundMessage {
    let body = serde_json::to_vec(event).unwrap_or_default();
    InboundMessage::new(meta(partition, offset), Some(body))
}

/// A message with no body.
#[must_use]
pub fn empty_message(partition: i32, offset: i64) -> InboundMessage {
    InboundMessage::new(meta(partition, offset), None)
}

/// A message whose body is not a valid event.
#[must_use]
pub fn malformed_message(partition: i32, offset: i64) -> InboundMessage {
    InboundMessage::new(meta(partition, offset), Some(b"{\"id\": \"e1\", \"topic\":".to_vec()))
}
