//! Error taxonomy for the consumer.
//!
//! Errors fall into three scopes:
//!
//! - **Startup** ([`ConsumerError::Connection`], [`ConsumerError::Subscription`],
//!   [`ConsumerError::NotConnected`]): terminal for the process, exit code 1
//! - **Per message** ([`ConsumerError::Decode`], [`ConsumerError::Processing`]):
//!   recovered inside the message handler, counted as failed, loop continues
//! - **Teardown** ([`ConsumerError::Shutdown`]): logged and absorbed
//!
//! [`ConsumerError::GroupInfo`] belongs to the on-demand diagnostic query and is
//! always surfaced to the caller.

use crate::broker::BrokerError;
use crate::event::DecodeFailure;
use crate::processor::ProcessingFailure;
use thiserror::Error;

/// Errors raised by the consumer lifecycle and message handling.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Broker cluster unreachable after bounded retries
    #[error("Connection failed after {attempts} attempts: {source}")]
    Connection {
        /// Number of connection attempts made
        attempts: usize,
        /// Last broker error observed
        #[source]
        source: BrokerError,
    },

    /// Subscribe or run-loop setup failed
    #[error("Subscription failed for topics {topics:?}: {source}")]
    Subscription {
        /// Topics the consumer tried to subscribe to
        topics: Vec<String>,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },

    /// Consumption requested before a successful connect
    #[error("Kafka consumer is not connected")]
    NotConnected,

    /// Malformed message body
    #[error("Decode failed at {topic}[{partition}]@{offset}: {source}")]
    Decode {
        /// Broker topic
        topic: String,
        /// Partition
        partition: i32,
        /// Offset
        offset: i64,
        /// Decoder error
        #[source]
        source: DecodeFailure,
    },

    /// Downstream processor failure for one event
    #[error("Processing failed for event '{event_id}': {source}")]
    Processing {
        /// Identifier of the event that failed
        event_id: String,
        /// Processor error
        #[source]
        source: ProcessingFailure,
    },

    /// Failure while tearing down the broker session
    #[error("Shutdown error: {0}")]
    Shutdown(#[source] BrokerError),

    /// Consumer group introspection failed
    #[error("Failed to describe consumer group '{group_id}': {source}")]
    GroupInfo {
        /// Group that was queried
        group_id: String,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },
}

impl ConsumerError {
    /// `true` for errors that must terminate the process at startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Subscription { .. } | Self::NotConnected
        )
    }
}

/// Result alias for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;
