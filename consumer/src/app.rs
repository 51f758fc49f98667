//! Application wiring: build components, start consuming, wait for shutdown.

use crate::config::Config;
use affiliate_consumer_core::broker::BrokerClient;
use affiliate_consumer_core::processor::{EventProcessor, LoggingProcessor};
use affiliate_consumer_redpanda::RedpandaBroker;
use affiliate_consumer_runtime::reporter::spawn_metrics_reporter;
use affiliate_consumer_runtime::service::ConsumerService;
use affiliate_consumer_runtime::shutdown::{
    ShutdownCoordinator, ShutdownHandler, ShutdownOutcome, ShutdownTrigger, TriggerReceiver,
    TriggerSender, install_panic_hook, spawn_signal_listener, trigger_channel,
};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// A wired consumer: lifecycle controller plus its shutdown coordinator.
pub struct Application {
    service: Arc<ConsumerService>,
    coordinator: Arc<ShutdownCoordinator>,
    metrics_interval: Duration,
}

impl Application {
    /// Wire a consumer over `broker`, dispatching events to `processor`.
    #[must_use]
    pub fn new(
        config: &Config,
        broker: Arc<dyn BrokerClient>,
        processor: Arc<dyn EventProcessor>,
    ) -> Self {
        let service = Arc::new(ConsumerService::new(
            config.service_config(),
            broker,
            processor,
        ));

        let handler: Arc<dyn ShutdownHandler> = service.clone();
        let mut coordinator = ShutdownCoordinator::new(config.shutdown_timeout());
        coordinator.register(handler);

        Self {
            service,
            coordinator: Arc::new(coordinator),
            metrics_interval: config.metrics_interval(),
        }
    }

    /// The lifecycle controller.
    #[must_use]
    pub const fn service(&self) -> &Arc<ConsumerService> {
        &self.service
    }

    /// Connect and start consuming.
    ///
    /// On failure the service is disconnected before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the connection or subscription error that stopped startup.
    pub async fn start(&self) -> anyhow::Result<()> {
        let started = async {
            self.service
                .connect()
                .await
                .context("Failed to connect to Kafka")?;
            self.service
                .start_consuming()
                .await
                .context("Failed to start consuming")
        }
        .await;

        if started.is_err() {
            self.service.disconnect().await;
        }
        started
    }

    /// Report metrics until a trigger arrives, then shut down once.
    pub async fn run_until_shutdown(
        self,
        triggers: TriggerSender,
        receiver: TriggerReceiver,
    ) -> ShutdownOutcome {
        let reporter = spawn_metrics_reporter(
            Arc::clone(&self.service),
            self.metrics_interval,
            self.coordinator.subscribe(),
        );

        let supervisor = {
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                let result = reporter.await;
                if !coordinator.is_shutting_down() {
                    error!(result = ?result, "Metrics reporter exited unexpectedly");
                    triggers.trigger(ShutdownTrigger::TaskFailure(
                        "metrics reporter exited".to_string(),
                    ));
                }
            })
        };

        let outcome = Arc::clone(&self.coordinator)
            .run_until_shutdown(receiver)
            .await;
        if let Err(err) = supervisor.await {
            error!(error = %err, "Task supervisor failed");
        }
        outcome
    }
}

/// Run the consumer against the configured Kafka cluster.
///
/// # Errors
///
/// Returns an error if the client cannot be configured or startup fails.
pub async fn run(config: Config) -> anyhow::Result<ShutdownOutcome> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.app.environment,
        brokers = ?config.kafka.brokers,
        group_id = %config.kafka.group_id,
        "Starting affiliate consumer"
    );
    affiliate_consumer_core::metrics::describe_metrics();

    let broker = RedpandaBroker::new(config.kafka_settings());
    let app = Application::new(&config, Arc::new(broker), Arc::new(LoggingProcessor));

    let (triggers, receiver) = trigger_channel();
    install_panic_hook(triggers.clone());
    let signals = spawn_signal_listener(triggers.clone());

    app.start().await?;
    info!(topics = ?app.service().topics(), "Affiliate consumer started successfully");

    let outcome = app.run_until_shutdown(triggers, receiver).await;
    signals.abort();
    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use affiliate_consumer_testing::broker::InMemoryBroker;
    use affiliate_consumer_testing::fixtures::{message_for, sample_event};
    use affiliate_consumer_testing::mocks::RecordingProcessor;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[tokio::test]
    async fn signal_drives_clean_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let processor = Arc::new(RecordingProcessor::new());
        let app = Application::new(&config(&[]), broker.clone(), processor.clone());

        app.start().await.unwrap();
        assert!(broker.deliver(message_for(&sample_event(), 0, 1)).await);
        let service = Arc::clone(app.service());

        let (triggers, receiver) = trigger_channel();
        assert!(triggers.trigger(ShutdownTrigger::Signal("SIGTERM")));
        let outcome = app.run_until_shutdown(triggers, receiver).await;

        assert_eq!(outcome.exit_code(), Some(0));
        assert_eq!(processor.events().len(), 1);
        assert!(!broker.is_connected());
        assert!(!service.is_connected());
        assert_eq!(service.metrics().counters.processed_events, 1);
    }

    #[tokio::test]
    async fn startup_failure_disconnects() {
        let broker = Arc::new(InMemoryBroker::new().failing_connects(5));
        let app = Application::new(
            &config(&[("KAFKA_RETRY_MAX_RETRIES", "1"), ("KAFKA_RETRY_INITIAL_MS", "1")]),
            broker.clone(),
            Arc::new(RecordingProcessor::new()),
        );

        let err = app.start().await.unwrap_err();

        assert!(err.to_string().contains("Failed to connect to Kafka"));
        assert_eq!(broker.connect_calls(), 2);
        assert_eq!(broker.disconnect_calls(), 1);
        assert!(!app.service().is_connected());
    }

    #[tokio::test]
    async fn subscription_failure_is_a_startup_failure() {
        let broker = Arc::new(InMemoryBroker::new().failing_subscribe());
        let app = Application::new(
            &config(&[]),
            broker.clone(),
            Arc::new(RecordingProcessor::new()),
        );

        let err = app.start().await.unwrap_err();

        assert!(err.to_string().contains("Failed to start consuming"));
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn shutdown_timeout_yields_failure_exit() {
        let broker =
            Arc::new(InMemoryBroker::new().with_disconnect_delay(Duration::from_secs(5)));
        let app = Application::new(
            &config(&[("SHUTDOWN_TIMEOUT_SECS", "0")]),
            broker,
            Arc::new(RecordingProcessor::new()),
        );
        app.start().await.unwrap();

        let (triggers, receiver) = trigger_channel();
        triggers.trigger(ShutdownTrigger::Panic("boom".to_string()));
        let outcome = app.run_until_shutdown(triggers, receiver).await;

        assert_eq!(outcome.exit_code(), Some(1));
    }
}
