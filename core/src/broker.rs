//! Broker client abstraction.
//!
//! The [`BrokerClient`] trait is the seam between the consumer lifecycle and the
//! message broker. The production implementation lives in
//! `affiliate-consumer-redpanda` (rdkafka); `affiliate-consumer-testing` provides an
//! in-memory implementation for tests.
//!
//! # Delivery Model
//!
//! After [`BrokerClient::run`] the client owns a consume loop that calls
//! [`MessageSink::on_message`] once per delivered message and awaits it before
//! fetching the next one. Within a partition, messages therefore reach the sink
//! in broker order. No ordering holds across partitions or topics.

use crate::event::InboundMessage;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by broker client implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Session could not be established
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Topic subscription failed
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Consume loop failed to start, stop, or fetch
    #[error("Consume failed: {0}")]
    Consume(String),

    /// Administrative query failed
    #[error("Admin request failed: {0}")]
    Admin(String),

    /// Operation requires an established session
    #[error("Broker session is not established")]
    NotConnected,
}

/// Where a fresh subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribeMode {
    /// Resume from the group's committed offsets; new groups start at the log end
    #[default]
    Committed,
    /// Replay the log from the earliest retained offset
    FromBeginning,
}

/// Receives messages from a running consume loop.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Handle one delivered message.
    ///
    /// Implementations must not fail: the consume loop advances past the message
    /// once this returns.
    async fn on_message(&self, message: InboundMessage);
}

/// One member of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    /// Broker-assigned member id
    pub member_id: String,
    /// Client id the member connected with
    pub client_id: String,
    /// Host the member connected from
    pub client_host: String,
}

/// Read-only description of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDescription {
    /// Group id
    pub group_id: String,
    /// Coordinator-reported state (e.g. `Stable`, `Empty`)
    pub state: String,
    /// Assignment protocol (e.g. `range`)
    pub protocol: String,
    /// Protocol type (normally `consumer`)
    pub protocol_type: String,
    /// Current members
    pub members: Vec<GroupMember>,
}

/// Kafka-compatible consumer session.
///
/// All operations are async and may suspend on network I/O. Implementations must
/// be `Send + Sync` so the lifecycle controller can share them across tasks.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Establish a session with the cluster (single attempt; callers retry).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connect`] if the cluster cannot be reached.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Join the consumer group and subscribe to `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Subscribe`] on rejection, or
    /// [`BrokerError::NotConnected`] without a session.
    async fn subscribe(&self, topics: &[String], mode: SubscribeMode) -> Result<(), BrokerError>;

    /// Start the consume loop, delivering each message to `sink`.
    ///
    /// Returns once the loop is running; delivery continues in the background
    /// until [`BrokerClient::stop`] or [`BrokerClient::disconnect`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consume`] if the loop cannot start.
    async fn run(&self, sink: Arc<dyn MessageSink>) -> Result<(), BrokerError>;

    /// Stop the consume loop, waiting for the in-flight message to finish.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consume`] if the loop terminated abnormally.
    async fn stop(&self) -> Result<(), BrokerError>;

    /// Tear down the session. Safe to call without a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session could not be closed cleanly.
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Describe `group_id` using a short-lived administrative session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Admin`] if the query fails.
    async fn describe_group(&self, group_id: &str) -> Result<GroupDescription, BrokerError>;
}
