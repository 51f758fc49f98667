//! Consumer lifecycle controller.
//!
//! [`ConsumerService`] owns the broker session, the subscription, the consume
//! loop, and the metrics register. It moves through these states:
//!
//! ```text
//!            connect()              start_consuming()
//!   Idle ───────────────► Connected ─────────────────► Consuming
//!    │                       ▲   │                        │
//!    │                       │   │ disconnect()           │ disconnect()
//!    │ disconnect()          │   ▼                        │ (stop, then close)
//!    └──────────────► Disconnected ◄──────────────────────┘
//!                       │  connect()
//!                       └──────────► Connected
//! ```
//!
//! Transitions are serialized by an async mutex. `connect()` releases it while
//! backing off, so `disconnect()` and state reads never wait on a retry; a
//! disconnect that lands mid-connect wins and the new session is closed. The
//! `is_connected` / `is_consuming` flags mirror the state for lock-free health
//! reads and always satisfy `is_consuming => is_connected`.

use crate::handler::MessageHandler;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::shutdown::ShutdownHandler;
use affiliate_consumer_core::analytics_topic;
use affiliate_consumer_core::broker::{
    BrokerClient, BrokerError, GroupDescription, MessageSink, SubscribeMode,
};
use affiliate_consumer_core::environment::Clock;
use affiliate_consumer_core::error::{ConsumerError, Result};
use affiliate_consumer_core::metrics::{MetricsRegister, MetricsSnapshot};
use affiliate_consumer_core::processor::EventProcessor;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Identity and connection settings for a [`ConsumerService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bootstrap broker addresses (`host:port`)
    pub brokers: Vec<String>,
    /// Client id presented to the cluster
    pub client_id: String,
    /// Consumer group id
    pub group_id: String,
    /// Environment-specific topic prefix
    pub topic_prefix: String,
    /// Backoff applied to connection attempts
    pub retry: RetryPolicy,
}

/// Lifecycle state of a [`ConsumerService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, never connected
    Idle,
    /// Broker session established
    Connected,
    /// Consume loop running
    Consuming,
    /// Session torn down
    Disconnected,
}

/// Coarse health reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Broker session established
    Connected,
    /// No broker session
    Disconnected,
    /// No service to inspect yet
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Unknown => "unknown",
        })
    }
}

/// Long-running consumer of the analytics events topic.
pub struct ConsumerService {
    config: ServiceConfig,
    topics: Vec<String>,
    broker: Arc<dyn BrokerClient>,
    handler: Arc<MessageHandler>,
    metrics: Arc<MetricsRegister>,
    state: Mutex<LifecycleState>,
    connecting: Mutex<()>,
    disconnects: AtomicU64,
    is_connected: AtomicBool,
    is_consuming: AtomicBool,
}

impl ConsumerService {
    /// Create a service in the `Idle` state.
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        broker: Arc<dyn BrokerClient>,
        processor: Arc<dyn EventProcessor>,
    ) -> Self {
        Self::with_metrics(config, broker, processor, Arc::new(MetricsRegister::new()))
    }

    /// Create a service whose metrics read time from `clock`.
    #[must_use]
    pub fn with_clock(
        config: ServiceConfig,
        broker: Arc<dyn BrokerClient>,
        processor: Arc<dyn EventProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_metrics(
            config,
            broker,
            processor,
            Arc::new(MetricsRegister::with_clock(clock)),
        )
    }

    fn with_metrics(
        config: ServiceConfig,
        broker: Arc<dyn BrokerClient>,
        processor: Arc<dyn EventProcessor>,
        metrics: Arc<MetricsRegister>,
    ) -> Self {
        let topics = vec![analytics_topic(&config.topic_prefix)];
        let handler = Arc::new(MessageHandler::new(Arc::clone(&metrics), processor));

        Self {
            config,
            topics,
            broker,
            handler,
            metrics,
            state: Mutex::new(LifecycleState::Idle),
            connecting: Mutex::new(()),
            disconnects: AtomicU64::new(0),
            is_connected: AtomicBool::new(false),
            is_consuming: AtomicBool::new(false),
        }
    }

    /// Establish the broker session, retrying transient failures with backoff.
    ///
    /// A no-op when already connected or consuming.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Connection`] once the retry policy is exhausted,
    /// or if [`disconnect`](Self::disconnect) was called while attempts were in
    /// flight. The state is left unchanged by the attempt itself.
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        let generation = {
            let state = self.state.lock().await;
            if matches!(*state, LifecycleState::Connected | LifecycleState::Consuming) {
                warn!(state = ?*state, "Consumer is already connected");
                return Ok(());
            }
            self.disconnects.load(Ordering::SeqCst)
        };

        let policy = &self.config.retry;
        let attempt = retry_with_backoff(policy, || self.broker.connect()).await;

        let mut state = self.state.lock().await;
        if let Err(source) = attempt {
            error!(
                brokers = ?self.config.brokers,
                attempts = policy.max_attempts(),
                error = %source,
                "Failed to connect to Kafka"
            );
            return Err(ConsumerError::Connection {
                attempts: policy.max_attempts(),
                source,
            });
        }

        if self.disconnects.load(Ordering::SeqCst) != generation {
            warn!("Disconnect requested while connecting, closing new session");
            if let Err(source) = self.broker.disconnect().await {
                let err = ConsumerError::Shutdown(source);
                error!(error = %err, "Error disconnecting from Kafka");
            }
            return Err(ConsumerError::Connection {
                attempts: policy.max_attempts(),
                source: BrokerError::Connect("disconnected while connecting".to_string()),
            });
        }

        *state = LifecycleState::Connected;
        self.is_connected.store(true, Ordering::SeqCst);
        info!(
            brokers = ?self.config.brokers,
            client_id = %self.config.client_id,
            group_id = %self.config.group_id,
            "Connected to Kafka cluster"
        );
        Ok(())
    }

    /// Subscribe to the analytics topic and start the consume loop.
    ///
    /// The subscription resumes from the group's committed offsets, never from the
    /// beginning of the log. Calling this while already consuming logs a warning
    /// and returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::NotConnected`] if [`connect`](Self::connect) has not succeeded
    /// - [`ConsumerError::Subscription`] if subscribing or starting the loop fails;
    ///   the service stays `Connected`
    pub async fn start_consuming(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            LifecycleState::Consuming => {
                warn!("Consumer is already consuming messages");
                return Ok(());
            }
            LifecycleState::Connected => {}
            LifecycleState::Idle | LifecycleState::Disconnected => {
                return Err(ConsumerError::NotConnected);
            }
        }

        let started = async {
            self.broker
                .subscribe(&self.topics, SubscribeMode::Committed)
                .await?;
            let sink: Arc<dyn MessageSink> = Arc::clone(&self.handler) as Arc<dyn MessageSink>;
            self.broker.run(sink).await
        }
        .await;

        if let Err(source) = started {
            error!(
                topics = ?self.topics,
                error = %source,
                "Failed to start consuming messages"
            );
            return Err(ConsumerError::Subscription {
                topics: self.topics.clone(),
                source,
            });
        }

        *state = LifecycleState::Consuming;
        self.is_consuming.store(true, Ordering::SeqCst);
        info!(
            topics = ?self.topics,
            group_id = %self.config.group_id,
            "Started consuming messages"
        );
        Ok(())
    }

    /// Stop consuming and tear down the broker session.
    ///
    /// Safe to call in any state, repeatedly, and after partial failures. Teardown
    /// errors are logged and absorbed; the service always ends `Disconnected`.
    pub async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if *state == LifecycleState::Consuming {
            if let Err(source) = self.broker.stop().await {
                let err = ConsumerError::Shutdown(source);
                error!(error = %err, "Error stopping consume loop");
            }
            self.is_consuming.store(false, Ordering::SeqCst);
            *state = LifecycleState::Connected;
        }

        match self.broker.disconnect().await {
            Ok(()) => info!("Disconnected from Kafka cluster"),
            Err(source) => {
                let err = ConsumerError::Shutdown(source);
                error!(error = %err, "Error disconnecting from Kafka");
            }
        }

        self.is_connected.store(false, Ordering::SeqCst);
        *state = LifecycleState::Disconnected;
    }

    /// `Connected` while a broker session is established, else `Disconnected`.
    #[must_use]
    pub fn health_status(&self) -> HealthStatus {
        if self.is_connected() {
            HealthStatus::Connected
        } else {
            HealthStatus::Disconnected
        }
    }

    /// Counters merged with the current connection flags.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.is_connected(), self.is_consuming())
    }

    /// Describe the consumer group through a short-lived admin session.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::GroupInfo`] if the query fails.
    pub async fn group_info(&self) -> Result<GroupDescription> {
        self.broker
            .describe_group(&self.config.group_id)
            .await
            .map_err(|source| {
                error!(
                    group_id = %self.config.group_id,
                    error = %source,
                    "Failed to get consumer group info"
                );
                ConsumerError::GroupInfo {
                    group_id: self.config.group_id.clone(),
                    source,
                }
            })
    }

    /// Current lifecycle state (waits for any in-flight transition other than
    /// connection backoff).
    pub async fn lifecycle_state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    /// Whether a broker session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    /// Whether the consume loop is running.
    #[must_use]
    pub fn is_consuming(&self) -> bool {
        self.is_consuming.load(Ordering::SeqCst)
    }

    /// Topics this service consumes.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Service configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Shared metrics register, for clock-aware readers such as the reporter.
    #[must_use]
    pub fn metrics_register(&self) -> &Arc<MetricsRegister> {
        &self.metrics
    }
}

#[async_trait]
impl ShutdownHandler for ConsumerService {
    fn name(&self) -> &str {
        "kafka-consumer"
    }

    async fn shutdown(&self) -> std::result::Result<(), String> {
        self.disconnect().await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use affiliate_consumer_testing::broker::InMemoryBroker;
    use affiliate_consumer_testing::fixtures::{empty_message, message_for, sample_event};
    use affiliate_consumer_testing::mocks::{FailingProcessor, RecordingProcessor, test_clock};
    use std::time::Duration;

    fn config() -> ServiceConfig {
        ServiceConfig {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "test-client".to_string(),
            group_id: "test-group".to_string(),
            topic_prefix: "test".to_string(),
            retry: RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .jitter(false)
                .build(),
        }
    }

    fn service_with(
        broker: Arc<InMemoryBroker>,
        processor: Arc<dyn EventProcessor>,
    ) -> ConsumerService {
        ConsumerService::with_clock(config(), broker, processor, Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn new_service_is_idle_and_disconnected() {
        let service = service_with(
            Arc::new(InMemoryBroker::new()),
            Arc::new(RecordingProcessor::new()),
        );

        assert_eq!(service.lifecycle_state().await, LifecycleState::Idle);
        assert_eq!(service.health_status(), HealthStatus::Disconnected);
        assert_eq!(service.topics(), ["test-analytics-events".to_string()]);

        let snapshot = service.metrics();
        assert!(!snapshot.is_connected);
        assert!(!snapshot.is_consuming);
        assert_eq!(snapshot.counters.start_time, test_clock().now());
    }

    #[tokio::test]
    async fn connect_retries_transient_failures() {
        let broker = Arc::new(InMemoryBroker::new().failing_connects(2));
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();

        assert_eq!(broker.connect_calls(), 3);
        assert_eq!(service.lifecycle_state().await, LifecycleState::Connected);
        assert_eq!(service.health_status(), HealthStatus::Connected);
    }

    #[tokio::test]
    async fn connect_gives_up_after_retry_ceiling() {
        let broker = Arc::new(InMemoryBroker::new().failing_connects(10));
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        let err = service.connect().await.unwrap_err();

        assert!(matches!(err, ConsumerError::Connection { attempts: 3, .. }));
        assert!(err.is_fatal());
        assert_eq!(broker.connect_calls(), 3);
        assert_eq!(service.lifecycle_state().await, LifecycleState::Idle);
        assert_eq!(service.health_status(), HealthStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_connect_backoff_does_not_wait_and_wins() {
        let broker = Arc::new(InMemoryBroker::new().failing_connects(2));
        let service = Arc::new(service_with(
            broker.clone(),
            Arc::new(RecordingProcessor::new()),
        ));

        let connecting = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.connect().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(broker.connect_calls(), 1);

        assert_eq!(service.lifecycle_state().await, LifecycleState::Idle);
        service.disconnect().await;
        assert_eq!(service.lifecycle_state().await, LifecycleState::Disconnected);

        let err = connecting.await.unwrap().unwrap_err();

        assert!(matches!(err, ConsumerError::Connection { .. }));
        assert_eq!(broker.connect_calls(), 3);
        assert_eq!(broker.disconnect_calls(), 2);
        assert!(!broker.is_connected());
        assert!(!service.is_connected());
        assert_eq!(service.lifecycle_state().await, LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn start_consuming_requires_connection() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        let err = service.start_consuming().await.unwrap_err();

        assert!(matches!(err, ConsumerError::NotConnected));
        assert!(broker.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn start_consuming_subscribes_from_committed_offsets() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();
        service.start_consuming().await.unwrap();

        assert_eq!(
            broker.subscriptions(),
            vec![(vec!["test-analytics-events".to_string()], SubscribeMode::Committed)]
        );
        assert_eq!(service.lifecycle_state().await, LifecycleState::Consuming);
        assert!(service.metrics().is_consuming);
    }

    #[tokio::test]
    async fn start_consuming_twice_subscribes_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();
        service.start_consuming().await.unwrap();
        service.start_consuming().await.unwrap();

        assert_eq!(broker.subscriptions().len(), 1);
        assert_eq!(broker.run_calls(), 1);
        assert_eq!(service.lifecycle_state().await, LifecycleState::Consuming);
    }

    #[tokio::test]
    async fn subscription_failure_leaves_service_connected() {
        let broker = Arc::new(InMemoryBroker::new().failing_subscribe());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();
        let err = service.start_consuming().await.unwrap_err();

        assert!(matches!(err, ConsumerError::Subscription { .. }));
        assert_eq!(service.lifecycle_state().await, LifecycleState::Connected);
        assert!(!service.is_consuming());
    }

    #[tokio::test]
    async fn run_failure_is_a_subscription_error() {
        let broker = Arc::new(InMemoryBroker::new().failing_run());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();
        let err = service.start_consuming().await.unwrap_err();

        assert!(matches!(err, ConsumerError::Subscription { .. }));
        assert_eq!(service.lifecycle_state().await, LifecycleState::Connected);
    }

    #[tokio::test]
    async fn delivered_messages_flow_into_metrics() {
        let broker = Arc::new(InMemoryBroker::new());
        let processor = Arc::new(RecordingProcessor::new());
        let service = service_with(broker.clone(), processor.clone());
        let event = sample_event();

        service.connect().await.unwrap();
        service.start_consuming().await.unwrap();
        assert!(broker.deliver(message_for(&event, 0, 42)).await);
        assert!(broker.deliver(empty_message(0, 43)).await);

        let snapshot = service.metrics();
        assert_eq!(snapshot.counters.total_events, 2);
        assert_eq!(snapshot.counters.processed_events, 1);
        assert_eq!(snapshot.counters.failed_events, 0);
        assert_eq!(snapshot.counters.last_event_time, Some(test_clock().now()));
        assert_eq!(processor.events(), vec![event]);
    }

    #[tokio::test]
    async fn failing_processor_keeps_loop_consuming() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service_with(broker.clone(), Arc::new(FailingProcessor::new("boom")));

        service.connect().await.unwrap();
        service.start_consuming().await.unwrap();
        for offset in 0..4 {
            assert!(broker.deliver(message_for(&sample_event(), 1, offset)).await);
        }

        let snapshot = service.metrics();
        assert_eq!(snapshot.counters.processed_events, 0);
        assert_eq!(snapshot.counters.failed_events, 4);
        assert_eq!(service.lifecycle_state().await, LifecycleState::Consuming);
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_harmless() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.disconnect().await;

        assert_eq!(service.health_status(), HealthStatus::Disconnected);
        assert_eq!(service.lifecycle_state().await, LifecycleState::Disconnected);
        assert_eq!(broker.stop_calls(), 0);
    }

    #[tokio::test]
    async fn disconnect_stops_loop_then_closes_session() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();
        service.start_consuming().await.unwrap();
        service.disconnect().await;
        service.disconnect().await;

        assert_eq!(broker.stop_calls(), 1);
        assert_eq!(broker.disconnect_calls(), 2);
        assert!(!broker.is_running());
        assert!(!service.is_consuming());
        assert!(!service.is_connected());
        assert_eq!(service.lifecycle_state().await, LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_absorbs_teardown_errors() {
        let broker = Arc::new(InMemoryBroker::new().failing_stop().failing_disconnect());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();
        service.start_consuming().await.unwrap();
        service.disconnect().await;

        assert_eq!(service.health_status(), HealthStatus::Disconnected);
        assert!(!service.metrics().is_consuming);
    }

    #[tokio::test]
    async fn reconnect_after_disconnect() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();
        service.disconnect().await;
        service.connect().await.unwrap();

        assert_eq!(broker.connect_calls(), 2);
        assert_eq!(service.lifecycle_state().await, LifecycleState::Connected);
    }

    #[tokio::test]
    async fn group_info_is_surfaced() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service_with(broker.clone(), Arc::new(RecordingProcessor::new()));

        service.connect().await.unwrap();
        service.start_consuming().await.unwrap();
        let info = service.group_info().await.unwrap();

        assert_eq!(info.group_id, "test-group");
        assert_eq!(info.state, "Stable");
        assert_eq!(info.members.len(), 1);
    }

    #[tokio::test]
    async fn group_info_failure_is_not_swallowed() {
        let broker = Arc::new(InMemoryBroker::new().failing_describe());
        let service = service_with(broker, Arc::new(RecordingProcessor::new()));

        let err = service.group_info().await.unwrap_err();

        assert!(matches!(err, ConsumerError::GroupInfo { ref group_id, .. } if group_id == "test-group"));
    }

    #[test]
    fn health_status_renders_lowercase() {
        assert_eq!(HealthStatus::Connected.to_string(), "connected");
        assert_eq!(HealthStatus::Disconnected.to_string(), "disconnected");
        assert_eq!(HealthStatus::Unknown.to_string(), "unknown");
    }
}
