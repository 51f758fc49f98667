//! Kafka/Redpanda broker client for the affiliate analytics consumer.
//!
//! This crate provides [`RedpandaBroker`], the production implementation of the
//! [`BrokerClient`] trait from `affiliate-consumer-core`. It uses rdkafka, so it
//! works against any Kafka-compatible cluster (Redpanda, Apache Kafka, MSK).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Kafka cluster   │
//! └────────┬─────────┘
//!          │ StreamConsumer (group member)
//!          ▼
//! ┌──────────────────┐      watch<bool>      ┌──────────────┐
//! │   consume loop   │◄──────────────────────│    stop()    │
//! │  (tokio task)    │                       └──────────────┘
//! └────────┬─────────┘
//!          │ awaits each message
//!          ▼
//! ┌──────────────────┐
//! │   MessageSink    │
//! └────────┬─────────┘
//!          │ then
//!          ▼
//!   store offset (committed in the background)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once** with background commits:
//! - `enable.auto.commit=true`, `enable.auto.offset.store=false`
//! - An offset is stored only after the sink has returned for that message
//! - librdkafka commits stored offsets periodically and on close
//! - A crash between handling and commit redelivers the message
//!
//! Fresh groups start at the end of the log unless the subscription asks for
//! [`SubscribeMode::FromBeginning`].
//!
//! # Example
//!
//! ```no_run
//! use affiliate_consumer_redpanda::RedpandaBroker;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::builder()
//!     .brokers(["localhost:9092"])
//!     .client_id("saleshq-affiliate-consumer")
//!     .group_id("saleshq-affiliate-consumer-group")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use affiliate_consumer_core::broker::{
    BrokerClient, BrokerError, GroupDescription, GroupMember, MessageSink, SubscribeMode,
};
use affiliate_consumer_core::event::{DeliveryMeta, InboundMessage};
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::groups::GroupInfo;
use rdkafka::message::{Headers, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Connection and group settings for a [`RedpandaBroker`].
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Bootstrap broker addresses (`host:port`)
    pub brokers: Vec<String>,
    /// Client id presented to the cluster
    pub client_id: String,
    /// Consumer group id
    pub group_id: String,
    /// Group session timeout
    pub session_timeout: Duration,
    /// Group heartbeat interval
    pub heartbeat_interval: Duration,
    /// Upper bound on bytes fetched per partition per request
    pub max_partition_fetch_bytes: usize,
    /// Timeout for metadata and admin requests
    pub request_timeout: Duration,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "saleshq-affiliate-consumer".to_string(),
            group_id: "saleshq-affiliate-consumer-group".to_string(),
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
            max_partition_fetch_bytes: 1_048_576,
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct ConsumeLoop {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Session {
    consumer: Arc<StreamConsumer>,
    mode: SubscribeMode,
    consume_loop: Option<ConsumeLoop>,
}

/// rdkafka-backed [`BrokerClient`].
///
/// One instance holds at most one session: a group-member `StreamConsumer` plus
/// the task that drains it. Administrative queries use their own short-lived
/// client and never touch the session.
pub struct RedpandaBroker {
    settings: KafkaSettings,
    session: Mutex<Option<Session>>,
}

impl RedpandaBroker {
    /// Create a broker client from `settings` without connecting.
    #[must_use]
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    /// Create a new builder for configuring the client.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Settings this client connects with.
    #[must_use]
    pub const fn settings(&self) -> &KafkaSettings {
        &self.settings
    }

    /// Consumer configuration for a session subscribing in `mode`.
    #[must_use]
    pub fn consumer_config(&self, mode: SubscribeMode) -> ClientConfig {
        let settings = &self.settings;
        let offset_reset = match mode {
            SubscribeMode::Committed => "latest",
            SubscribeMode::FromBeginning => "earliest",
        };

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("client.id", &settings.client_id)
            .set("group.id", &settings.group_id)
            .set("session.timeout.ms", millis(settings.session_timeout))
            .set("heartbeat.interval.ms", millis(settings.heartbeat_interval))
            .set(
                "max.partition.fetch.bytes",
                settings.max_partition_fetch_bytes.to_string(),
            )
            .set("auto.offset.reset", offset_reset)
            .set("allow.auto.create.topics", "false")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");
        config
    }

    fn admin_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.settings.brokers.join(","))
            .set("client.id", format!("{}-admin", self.settings.client_id));
        config
    }

    /// Create a consumer and confirm the cluster answers a metadata request.
    async fn open_consumer(&self, mode: SubscribeMode) -> Result<Arc<StreamConsumer>, BrokerError> {
        let consumer: StreamConsumer = self
            .consumer_config(mode)
            .create()
            .map_err(|e| BrokerError::Connect(format!("Failed to create consumer: {e}")))?;
        let consumer = Arc::new(consumer);

        let probe = Arc::clone(&consumer);
        let timeout = self.settings.request_timeout;
        let brokers = tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| BrokerError::Connect(format!("Metadata probe task failed: {e}")))?
        .map_err(|e| BrokerError::Connect(format!("Cluster unreachable: {e}")))?;

        tracing::debug!(brokers, mode = ?mode, "Kafka metadata probe succeeded");
        Ok(consumer)
    }
}

/// Builder for configuring a [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    settings: KafkaSettings,
}

impl RedpandaBrokerBuilder {
    /// Set the bootstrap broker addresses.
    #[must_use]
    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the client id.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.settings.client_id = client_id.into();
        self
    }

    /// Set the consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.settings.group_id = group_id.into();
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.settings.session_timeout = timeout;
        self
    }

    /// Set the group heartbeat interval.
    ///
    /// Default: 3 seconds
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    /// Set the per-partition fetch ceiling in bytes.
    ///
    /// Default: 1 MiB
    #[must_use]
    pub const fn max_partition_fetch_bytes(mut self, bytes: usize) -> Self {
        self.settings.max_partition_fetch_bytes = bytes;
        self
    }

    /// Set the timeout for metadata and admin requests.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    /// Build the [`RedpandaBroker`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connect`] if no brokers or no group id are configured.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let settings = self.settings;
        if settings.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(BrokerError::Connect("Brokers not configured".to_string()));
        }
        if settings.group_id.trim().is_empty() {
            return Err(BrokerError::Connect("Group id not configured".to_string()));
        }

        tracing::debug!(
            brokers = ?settings.brokers,
            client_id = %settings.client_id,
            group_id = %settings.group_id,
            session_timeout = ?settings.session_timeout,
            heartbeat_interval = ?settings.heartbeat_interval,
            max_partition_fetch_bytes = settings.max_partition_fetch_bytes,
            "RedpandaBroker configured"
        );

        Ok(RedpandaBroker::new(settings))
    }
}

#[async_trait]
impl BrokerClient for RedpandaBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let mode = SubscribeMode::Committed;
        let consumer = self.open_consumer(mode).await?;
        *session = Some(Session {
            consumer,
            mode,
            consume_loop: None,
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[String], mode: SubscribeMode) -> Result<(), BrokerError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(BrokerError::NotConnected)?;

        // auto.offset.reset is fixed at creation, so a mode change needs a new member.
        if session.mode != mode {
            let replacement = self
                .open_consumer(mode)
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
            close_consumer(std::mem::replace(&mut session.consumer, replacement)).await;
            session.mode = mode;
        }

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        session
            .consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Subscribe(format!("Failed to subscribe to {topics:?}: {e}")))?;

        tracing::info!(
            topics = ?topics,
            group_id = %self.settings.group_id,
            mode = ?mode,
            "Subscribed to topics"
        );
        Ok(())
    }

    async fn run(&self, sink: Arc<dyn MessageSink>) -> Result<(), BrokerError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        if session.consume_loop.is_some() {
            return Err(BrokerError::Consume("Consume loop already running".to_string()));
        }

        let (cancel, cancelled) = watch::channel(false);
        let handle = tokio::spawn(
            consume_loop(Arc::clone(&session.consumer), sink, cancelled).in_current_span(),
        );
        session.consume_loop = Some(ConsumeLoop { cancel, handle });
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        let mut guard = self.session.lock().await;
        let Some(consume_loop) = guard.as_mut().and_then(|s| s.consume_loop.take()) else {
            return Ok(());
        };
        drop(guard);

        stop_loop(consume_loop).await
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        let stopped = match session.consume_loop.take() {
            Some(consume_loop) => stop_loop(consume_loop).await,
            None => Ok(()),
        };

        session.consumer.unsubscribe();
        close_consumer(session.consumer).await;
        stopped
    }

    async fn describe_group(&self, group_id: &str) -> Result<GroupDescription, BrokerError> {
        let config = self.admin_config();
        let group_id = group_id.to_string();
        let timeout = self.settings.request_timeout;

        tokio::task::spawn_blocking(move || {
            let admin: BaseConsumer = config
                .create()
                .map_err(|e| BrokerError::Admin(format!("Failed to create admin client: {e}")))?;
            let groups = admin
                .fetch_group_list(Some(group_id.as_str()), timeout)
                .map_err(|e| BrokerError::Admin(format!("Failed to list group {group_id}: {e}")))?;

            groups
                .groups()
                .iter()
                .find(|group| group.name() == group_id)
                .map(describe)
                .ok_or_else(|| BrokerError::Admin(format!("Group {group_id} not found")))
        })
        .await
        .map_err(|e| BrokerError::Admin(format!("Admin task failed: {e}")))?
    }
}

/// Drain `consumer` into `sink` until `cancelled` flips or the stream ends.
async fn consume_loop(
    consumer: Arc<StreamConsumer>,
    sink: Arc<dyn MessageSink>,
    mut cancelled: watch::Receiver<bool>,
) {
    let mut stream = consumer.stream();
    tracing::debug!("Consume loop started");

    loop {
        tokio::select! {
            biased;

            _ = cancelled.changed() => break,
            next = stream.next() => match next {
                Some(Ok(message)) => {
                    sink.on_message(to_inbound(&message)).await;

                    // Stores offset + 1, the next record to fetch.
                    if let Err(e) = consumer.store_offset_from_message(&message) {
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Failed to store offset (message may be redelivered)"
                        );
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Kafka consumer error");
                }
                None => break,
            },
        }
    }

    tracing::debug!("Consume loop exiting");
}

async fn stop_loop(consume_loop: ConsumeLoop) -> Result<(), BrokerError> {
    // A send error means the loop already exited and dropped its receiver.
    let _ = consume_loop.cancel.send(true);
    consume_loop
        .handle
        .await
        .map_err(|e| BrokerError::Consume(format!("Consume loop terminated abnormally: {e}")))
}

/// Leaving the group blocks inside librdkafka, so the final drop runs off the reactor.
async fn close_consumer(consumer: Arc<StreamConsumer>) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(consumer)).await {
        tracing::warn!(error = %e, "Failed to close Kafka consumer");
    }
}

/// Convert a delivered Kafka message into the broker-agnostic form.
pub fn to_inbound<M: Message>(message: &M) -> InboundMessage {
    let mut meta = DeliveryMeta::new(message.topic(), message.partition(), message.offset());
    meta.key = message
        .key()
        .map(|key| String::from_utf8_lossy(key).into_owned());
    meta.timestamp = message.timestamp().to_millis();

    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            meta.headers.insert(header.key.to_string(), value);
        }
    }

    InboundMessage::new(meta, message.payload().map(<[u8]>::to_vec))
}

fn describe(group: &GroupInfo) -> GroupDescription {
    GroupDescription {
        group_id: group.name().to_string(),
        state: group.state().to_string(),
        protocol: group.protocol().to_string(),
        protocol_type: group.protocol_type().to_string(),
        members: group
            .members()
            .iter()
            .map(|member| GroupMember {
                member_id: member.id().to_string(),
                client_id: member.client_id().to_string(),
                client_host: member.client_host().to_string(),
            })
            .collect(),
    }
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rdkafka::Timestamp;
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};

    #[test]
    fn redpanda_broker_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBroker>();
        assert_sync::<RedpandaBroker>();
    }

    #[test]
    fn consumer_config_carries_group_tuning() {
        let broker = RedpandaBroker::builder()
            .brokers(["kafka-1:9092", "kafka-2:9092"])
            .client_id("client")
            .group_id("group")
            .build()
            .unwrap();
        let config = broker.consumer_config(SubscribeMode::Committed);

        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(config.get("client.id"), Some("client"));
        assert_eq!(config.get("group.id"), Some("group"));
        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
        assert_eq!(config.get("heartbeat.interval.ms"), Some("3000"));
        assert_eq!(config.get("max.partition.fetch.bytes"), Some("1048576"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("allow.auto.create.topics"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn replay_mode_reads_from_earliest() {
        let broker = RedpandaBroker::new(KafkaSettings::default());
        let config = broker.consumer_config(SubscribeMode::FromBeginning);

        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn builder_rejects_missing_brokers() {
        let result = RedpandaBroker::builder().brokers(Vec::<String>::new()).build();
        assert!(matches!(result, Err(BrokerError::Connect(_))));

        let result = RedpandaBroker::builder().group_id(" ").build();
        assert!(matches!(result, Err(BrokerError::Connect(_))));
    }

    #[test]
    fn kafka_message_converts_with_headers() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "x-shopify-topic",
                value: Some("page_viewed"),
            })
            .insert(Header {
                key: "x-empty",
                value: None::<&str>,
            });
        let message = OwnedMessage::new(
            Some(b"{}".to_vec()),
            Some(b"s.myshopify.com".to_vec()),
            "saleshq-analytics-events".to_string(),
            Timestamp::CreateTime(1_704_067_200_000),
            2,
            42,
            Some(headers),
        );

        let inbound = to_inbound(&message);

        assert_eq!(inbound.meta.topic, "saleshq-analytics-events");
        assert_eq!(inbound.meta.partition, 2);
        assert_eq!(inbound.meta.offset, 42);
        assert_eq!(inbound.meta.key.as_deref(), Some("s.myshopify.com"));
        assert_eq!(inbound.meta.timestamp, Some(1_704_067_200_000));
        assert_eq!(
            inbound.meta.headers.get("x-shopify-topic").map(String::as_str),
            Some("page_viewed")
        );
        assert_eq!(inbound.meta.headers.get("x-empty").map(String::as_str), Some(""));
        assert_eq!(inbound.payload.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn tombstone_converts_to_empty_message() {
        let message = OwnedMessage::new(
            None,
            None,
            "saleshq-analytics-events".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );

        let inbound = to_inbound(&message);

        assert!(inbound.is_empty());
        assert!(inbound.meta.key.is_none());
        assert!(inbound.meta.timestamp.is_none());
        assert!(inbound.meta.headers.is_empty());
    }

    #[tokio::test]
    async fn operations_without_session() {
        let broker = RedpandaBroker::new(KafkaSettings::default());
        let topics = vec!["t".to_string()];

        assert_eq!(
            broker.subscribe(&topics, SubscribeMode::Committed).await,
            Err(BrokerError::NotConnected)
        );
        assert!(broker.stop().await.is_ok());
        assert!(broker.disconnect().await.is_ok());
    }
}
