//! Configuration management for the affiliate consumer.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Unparseable numeric values fall back to their defaults.

use affiliate_consumer_redpanda::KafkaSettings;
use affiliate_consumer_runtime::retry::RetryPolicy;
use affiliate_consumer_runtime::service::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Kafka connection and group configuration
    pub kafka: KafkaConfig,
    /// Process-level configuration
    pub app: AppConfig,
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap broker addresses
    pub brokers: Vec<String>,
    /// Client id presented to the cluster
    pub client_id: String,
    /// Consumer group id
    pub group_id: String,
    /// Environment-specific topic prefix
    pub topic_prefix: String,
    /// Session timeout in milliseconds (default: 30000)
    pub session_timeout_ms: u64,
    /// Heartbeat interval in milliseconds (default: 3000)
    pub heartbeat_interval_ms: u64,
    /// Max bytes fetched per partition per request (default: 1 MiB)
    pub max_partition_fetch_bytes: usize,
    /// First connect retry delay in milliseconds (default: 100)
    pub retry_initial_ms: u64,
    /// Connect retries after the first attempt (default: 8)
    pub retry_max_retries: usize,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per record
    Json,
    /// Compact human-readable lines
    Simple,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Simple
        })
    }
}

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Deployment environment name (development, staging, production)
    pub environment: String,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Seconds between periodic metrics records (default: 30)
    pub metrics_interval_secs: u64,
    /// Per-handler shutdown ceiling in seconds; unset waits indefinitely
    pub shutdown_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let brokers: Vec<String> = text("KAFKA_BROKERS", "localhost:9092")
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(ToString::to_string)
            .collect();

        Self {
            kafka: KafkaConfig {
                brokers: if brokers.is_empty() {
                    vec!["localhost:9092".to_string()]
                } else {
                    brokers
                },
                client_id: text("KAFKA_CLIENT_ID", "saleshq-affiliate-consumer"),
                group_id: text("KAFKA_GROUP_ID", "saleshq-affiliate-consumer-group"),
                topic_prefix: text("KAFKA_TOPIC_PREFIX", "saleshq"),
                session_timeout_ms: parsed(&lookup, "KAFKA_SESSION_TIMEOUT_MS").unwrap_or(30_000),
                heartbeat_interval_ms: parsed(&lookup, "KAFKA_HEARTBEAT_INTERVAL_MS")
                    .unwrap_or(3000),
                max_partition_fetch_bytes: parsed(&lookup, "KAFKA_MAX_PARTITION_FETCH_BYTES")
                    .unwrap_or(1_048_576),
                retry_initial_ms: parsed(&lookup, "KAFKA_RETRY_INITIAL_MS").unwrap_or(100),
                retry_max_retries: parsed(&lookup, "KAFKA_RETRY_MAX_RETRIES").unwrap_or(8),
            },
            app: AppConfig {
                environment: text("NODE_ENV", "development"),
                log_level: text("LOG_LEVEL", "info"),
                log_format: text("LOG_FORMAT", "json")
                    .parse()
                    .unwrap_or(LogFormat::Json),
                metrics_interval_secs: parsed(&lookup, "METRICS_INTERVAL_SECS")
                    .filter(|secs| *secs > 0)
                    .unwrap_or(30),
                shutdown_timeout_secs: parsed(&lookup, "SHUTDOWN_TIMEOUT_SECS"),
            },
        }
    }

    /// Backoff applied to connection attempts.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.kafka.retry_max_retries)
            .initial_delay(Duration::from_millis(self.kafka.retry_initial_ms))
            .build()
    }

    /// Lifecycle controller settings.
    #[must_use]
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            brokers: self.kafka.brokers.clone(),
            client_id: self.kafka.client_id.clone(),
            group_id: self.kafka.group_id.clone(),
            topic_prefix: self.kafka.topic_prefix.clone(),
            retry: self.retry_policy(),
        }
    }

    /// rdkafka client settings.
    #[must_use]
    pub fn kafka_settings(&self) -> KafkaSettings {
        KafkaSettings {
            brokers: self.kafka.brokers.clone(),
            client_id: self.kafka.client_id.clone(),
            group_id: self.kafka.group_id.clone(),
            session_timeout: Duration::from_millis(self.kafka.session_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.kafka.heartbeat_interval_ms),
            max_partition_fetch_bytes: self.kafka.max_partition_fetch_bytes,
            ..KafkaSettings::default()
        }
    }

    /// Interval between periodic metrics records.
    #[must_use]
    pub const fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.app.metrics_interval_secs)
    }

    /// Per-handler shutdown ceiling, if any.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.app.shutdown_timeout_secs.map(Duration::from_secs)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}
