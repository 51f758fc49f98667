//! Integration tests for [`RedpandaBroker`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Connect, subscribe, and consume round-trip into a sink
//! - Per-partition ordering of delivered messages
//! - Consumer group description while a member is active
//! - Clean stop and disconnect
//!
//! # Running These Tests
//!
//! Tests that need Docker are marked `#[ignore]`. To run them explicitly:
//! ```bash
//! cargo test -p affiliate-consumer-redpanda --test integration_tests -- --ignored
//! ```
//!
//! # Panics
//!
//! These tests use `expect()` and `panic!()` for setup failures, which is acceptable in test code.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use affiliate_consumer_core::broker::{BrokerClient, BrokerError, MessageSink, SubscribeMode};
use affiliate_consumer_core::event::{InboundMessage, PixelEvent};
use affiliate_consumer_redpanda::RedpandaBroker;
use affiliate_consumer_testing::fixtures::sample_event;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use tokio::sync::mpsc;

const TOPIC: &str = "it-analytics-events";

/// Sink that forwards every delivered message to a channel.
struct ChannelSink {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn on_message(&self, message: InboundMessage) {
        let _ = self.tx.send(message);
    }
}

fn producer(brokers: &str) -> FutureProducer {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()
        .expect("Failed to create producer")
}

async fn publish(producer: &FutureProducer, key: &str, event: &PixelEvent) {
    let payload = serde_json::to_vec(event).expect("Failed to encode event");
    producer
        .send(
            FutureRecord::to(TOPIC).key(key).payload(&payload),
            Timeout::After(Duration::from_secs(5)),
        )
        .await
        .expect("Failed to publish event");
}

/// Publish a warmup record until the broker accepts it, creating the topic.
async fn wait_for_topic(producer: &FutureProducer) {
    let warmup = sample_event();
    for attempt in 1..=60 {
        let payload = serde_json::to_vec(&warmup).expect("Failed to encode event");
        let sent = producer
            .send(
                FutureRecord::to(TOPIC).key("warmup").payload(&payload),
                Timeout::After(Duration::from_secs(2)),
            )
            .await;
        if sent.is_ok() {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Kafka topic never became available");
    }
}

#[tokio::test]
#[ignore]
async fn consumes_published_events_in_partition_order() {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    let producer = producer(&brokers);
    wait_for_topic(&producer).await;

    let broker = RedpandaBroker::builder()
        .brokers([brokers.as_str()])
        .client_id("it-client")
        .group_id("it-group")
        .build()
        .expect("Failed to configure broker");

    broker.connect().await.expect("Failed to connect");
    broker
        .subscribe(&[TOPIC.to_string()], SubscribeMode::FromBeginning)
        .await
        .expect("Failed to subscribe");

    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .run(Arc::new(ChannelSink { tx }))
        .await
        .expect("Failed to start consume loop");

    let mut first = sample_event();
    first.id = "it-1".to_string();
    let mut second = sample_event();
    second.id = "it-2".to_string();
    publish(&producer, "shop-a", &first).await;
    publish(&producer, "shop-a", &second).await;

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while received.len() < 2 {
            let message = rx.recv().await.expect("Sink channel closed");
            if message.meta.key.as_deref() == Some("shop-a") {
                received.push(message);
            }
        }
    })
    .await
    .expect("Timeout waiting for events");

    let ids: Vec<String> = received
        .iter()
        .map(|m| {
            PixelEvent::from_slice(m.payload.as_deref().expect("Missing payload"))
                .expect("Failed to decode event")
                .id
        })
        .collect();
    assert_eq!(ids, vec!["it-1", "it-2"]);
    assert_eq!(received[0].meta.topic, TOPIC);
    assert!(received[0].meta.offset < received[1].meta.offset);
    assert!(received[0].meta.timestamp.is_some());

    let group = broker
        .describe_group("it-group")
        .await
        .expect("Failed to describe group");
    assert_eq!(group.group_id, "it-group");
    assert_eq!(group.protocol_type, "consumer");

    broker.stop().await.expect("Failed to stop consume loop");
    broker.disconnect().await.expect("Failed to disconnect");
    broker.disconnect().await.expect("Second disconnect should be a no-op");
}

#[tokio::test]
async fn connect_to_unreachable_cluster_fails() {
    let broker = RedpandaBroker::builder()
        .brokers(["127.0.0.1:1"])
        .request_timeout(Duration::from_millis(500))
        .build()
        .expect("Failed to configure broker");

    let result = broker.connect().await;

    assert!(matches!(result, Err(BrokerError::Connect(_))));
    assert!(broker.disconnect().await.is_ok());
}
